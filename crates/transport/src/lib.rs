//! Broker abstraction for the notification pipeline.
//!
//! The rest of the system never speaks broker vocabulary. It sees three
//! small traits:
//!
//! - [`Transport`] — dials the broker and yields a connection
//! - [`BrokerConnection`] — the one shared logical connection; workers lease
//!   [`BrokerChannel`]s from it
//! - [`BrokerChannel`] — per-worker consume/ack surface, bounded by prefetch
//!
//! Raw client errors are classified into an abstract [`ErrorKind`] here, so
//! retry policy upstream stays independent of any particular client library.
//!
//! Implementations: [`RedisTransport`] (Redis Streams consumer groups) for
//! production, [`MemoryTransport`] for tests.

pub mod error;
pub mod memory;
pub mod redis;

pub use error::{ErrorKind, TransportError};
pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;

use std::time::Duration;

use async_trait::async_trait;

/// The durable queue the pool consumes, plus its parking lot.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue (stream) name.
    pub name: String,
    /// Consumer group shared by all pool workers.
    pub group: String,
    /// Where poison messages go instead of being retried forever.
    pub parking: String,
    /// Optional bound on queue length; oldest entries are evicted past it.
    pub max_length: Option<u64>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        let name = name.into();
        let parking = format!("{}:parked", name);
        Self {
            name,
            group: group.into(),
            parking,
            max_length: None,
        }
    }

    pub fn with_parking(mut self, parking: impl Into<String>) -> Self {
        self.parking = parking.into();
        self
    }

    pub fn with_max_length(mut self, max_length: Option<u64>) -> Self {
        self.max_length = max_length;
        self
    }
}

/// A single inbound message leased to a worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned message id, used for ack/nack.
    pub message_id: String,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// How many times the broker has handed this message out, this delivery
    /// included. Starts at 1.
    pub delivery_count: u32,
}

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a fresh logical connection. Errors carry an [`ErrorKind`]
    /// for the retry policy.
    async fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// The one shared logical connection, owned by the supervisor.
///
/// Workers only derive channels from it; the supervisor alone decides when
/// it is replaced or closed.
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Lease a new channel for one worker.
    async fn open_channel(&self) -> Result<Self::Channel, TransportError>;

    /// Resolves when the broker drops the connection out from under us.
    async fn closed(&self);

    /// Close the connection. Channels must already be closed.
    async fn close(&self);
}

/// Per-worker consume surface. Not shared across workers.
#[async_trait]
pub trait BrokerChannel: Send + 'static {
    /// Bind this channel to the queue, creating it if missing. A concurrent
    /// declare by another worker or process is not an error.
    async fn declare(&mut self, queue: &QueueSpec) -> Result<(), TransportError>;

    /// Fetch up to `max` deliveries, waiting at most `wait` for the first
    /// one. `max` is the channel's prefetch bound: deliveries returned here
    /// stay outstanding until acked, nacked, or parked.
    async fn fetch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Acknowledge successful processing.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue` the broker will hand it out again;
    /// without, it is discarded.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;

    /// Move a delivery to the parking queue and settle the original.
    async fn park(&mut self, delivery: &Delivery, reason: &str) -> Result<(), TransportError>;

    /// Producer side: append a payload to the queue. Returns the broker
    /// message id. Honors the queue's `max_length` bound.
    async fn publish(&mut self, payload: &[u8]) -> Result<String, TransportError>;

    /// Release the channel. Idempotent.
    async fn close(&mut self);
}
