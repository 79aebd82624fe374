//! Shared application state for the Axum health server.

use sqlx::PgPool;
use tokio::sync::watch;

use courier_pipeline::BrokerStatus;

/// Application state shared across route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Read side of the supervisor's status channel. Observing it never
    /// touches the supervisor's own retry state.
    pub broker: watch::Receiver<BrokerStatus>,
}

impl AppState {
    pub fn new(pool: PgPool, broker: watch::Receiver<BrokerStatus>) -> Self {
        Self { pool, broker }
    }
}
