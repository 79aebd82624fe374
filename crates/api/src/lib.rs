//! Courier service surface: the health endpoint and the binary that wires
//! the supervisor, consumer pool, and delivery gateway together.

pub mod routes;
pub mod state;
