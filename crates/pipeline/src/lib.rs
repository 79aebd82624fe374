//! The notification delivery pipeline.
//!
//! Events published by the application land on a durable queue. This crate
//! consumes them reliably and turns them into durable, delivered
//! notifications:
//!
//! 1. [`Supervisor`] owns the one broker connection and reconnects with
//!    backoff, degrading to a slow retry interval instead of ever giving up
//! 2. [`ConsumerPool`] runs a fixed set of workers, each leasing its own
//!    channel with a bounded prefetch
//! 3. [`Processor`] validates, persists (idempotently), and fans out — in
//!    that order, acking only after a successful persist
//!
//! Messages for the same recipient may be processed by different workers, so
//! no ordering is guaranteed across workers — only within one.

pub mod pool;
pub mod processor;
pub mod retry;
pub mod store;
pub mod supervisor;

pub use pool::{ConsumerPool, PoolConfig};
pub use processor::{Outcome, Processor};
pub use retry::RetryPolicy;
pub use store::{MemoryStore, NotificationStore, PgNotificationStore, StoreError};
pub use supervisor::{BrokerStatus, Supervisor};
