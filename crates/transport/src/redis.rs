//! Redis Streams transport.
//!
//! The durable queue is a stream consumed through a consumer group:
//!
//! - declare     → `XGROUP CREATE ... MKSTREAM` (BUSYGROUP tolerated)
//! - fetch       → `XAUTOCLAIM` (redeliver stalled entries) + `XREADGROUP`
//! - ack         → `XACK`
//! - nack        → leave pending; the entry comes back via `XAUTOCLAIM`
//!                 once `requeue_idle` elapses, with its delivery count
//!                 maintained by Redis
//! - park        → `XADD` to the parking stream, then `XACK` the original
//! - publish     → `XADD`, with `MAXLEN ~` when the queue is bounded

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};

use crate::error::{ErrorKind, TransportError};
use crate::{BrokerChannel, BrokerConnection, Delivery, QueueSpec, Transport};

/// How long a delivery may sit unacknowledged before another worker may
/// reclaim it.
const DEFAULT_REQUEUE_IDLE: Duration = Duration::from_secs(30);

/// Interval between liveness pings used to detect unsolicited disconnects.
const CLOSED_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Field name carrying the message body inside a stream entry.
const PAYLOAD_FIELD: &str = "payload";

/// Translate a client error into the abstract taxonomy.
///
/// `fallback` is the operation-level kind used when the error is neither an
/// authentication failure nor a dropped connection.
fn classify(err: redis::RedisError, fallback: ErrorKind) -> TransportError {
    let kind = if err.kind() == redis::ErrorKind::AuthenticationFailed
        || err.code() == Some("NOAUTH")
        || err.code() == Some("WRONGPASS")
    {
        ErrorKind::Auth
    } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        match fallback {
            ErrorKind::Connect => ErrorKind::Connect,
            _ => ErrorKind::ChannelClosed,
        }
    } else {
        fallback
    };

    TransportError::new(kind, err.to_string())
}

fn value_bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

fn delivery_from_entry(entry: &StreamId, delivery_count: u32) -> Option<Delivery> {
    let payload = entry.map.get(PAYLOAD_FIELD).and_then(value_bytes)?;
    Some(Delivery {
        message_id: entry.id.clone(),
        payload,
        delivery_count,
    })
}

/// Redis-backed [`Transport`].
pub struct RedisTransport {
    url: String,
    requeue_idle: Duration,
}

impl RedisTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            requeue_idle: DEFAULT_REQUEUE_IDLE,
        }
    }

    /// Override how long an unacked delivery sits before redelivery.
    pub fn with_requeue_idle(mut self, requeue_idle: Duration) -> Self {
        self.requeue_idle = requeue_idle;
        self
    }
}

#[async_trait]
impl Transport for RedisTransport {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        let client =
            Client::open(self.url.as_str()).map_err(|e| classify(e, ErrorKind::Connect))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify(e, ErrorKind::Connect))?;

        tracing::info!("Connected to broker");

        Ok(RedisConnection {
            conn,
            requeue_idle: self.requeue_idle,
            consumer_seq: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// The shared logical connection. Channels are cheap handles multiplexed
/// over the same socket, each with its own consumer identity in the group.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    requeue_idle: Duration,
    consumer_seq: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    type Channel = RedisChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportError> {
        let n = self.consumer_seq.fetch_add(1, Ordering::Relaxed);
        Ok(RedisChannel {
            conn: self.conn.clone(),
            consumer: format!("courier-{}", n),
            requeue_idle: self.requeue_idle,
            queue: None,
            open: true,
        })
    }

    async fn closed(&self) {
        // The multiplexed client has no disconnect callback; probe instead.
        let mut conn = self.conn.clone();
        loop {
            tokio::time::sleep(CLOSED_PROBE_INTERVAL).await;
            let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
            if let Err(e) = pong {
                tracing::warn!(error = %e, "Broker connection lost");
                return;
            }
        }
    }

    async fn close(&self) {
        // Dropping the last handle tears down the socket.
        tracing::debug!("Broker connection released");
    }
}

/// One worker's consume surface over the shared connection.
pub struct RedisChannel {
    conn: MultiplexedConnection,
    consumer: String,
    requeue_idle: Duration,
    queue: Option<QueueSpec>,
    open: bool,
}

impl RedisChannel {
    fn queue(&self) -> Result<&QueueSpec, TransportError> {
        if !self.open {
            return Err(TransportError::channel_closed("channel is closed"));
        }
        self.queue
            .as_ref()
            .ok_or_else(|| TransportError::consume("channel has no declared queue"))
    }

    /// Reclaim deliveries that have sat unacknowledged past `requeue_idle`,
    /// preserving their broker-side delivery counts.
    async fn reclaim(&mut self, max: usize) -> Result<Vec<Delivery>, TransportError> {
        let spec = self.queue()?.clone();
        let idle_ms = self.requeue_idle.as_millis() as u64;

        let reply: StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                &spec.name,
                &spec.group,
                &self.consumer,
                idle_ms,
                "0-0",
                StreamAutoClaimOptions::default().count(max),
            )
            .await
            .map_err(|e| classify(e, ErrorKind::Consume))?;

        if reply.claimed.is_empty() {
            return Ok(Vec::new());
        }

        // Delivery counts live in the pending entries list.
        let first = reply.claimed.first().map(|e| e.id.clone()).unwrap_or_default();
        let last = reply.claimed.last().map(|e| e.id.clone()).unwrap_or_default();
        let pending: StreamPendingCountReply = self
            .conn
            .xpending_count(&spec.name, &spec.group, &first, &last, reply.claimed.len())
            .await
            .map_err(|e| classify(e, ErrorKind::Consume))?;

        let counts: std::collections::HashMap<&str, u32> = pending
            .ids
            .iter()
            .map(|p| (p.id.as_str(), p.times_delivered as u32))
            .collect();

        let deliveries = reply
            .claimed
            .iter()
            .filter_map(|entry| {
                let count = counts.get(entry.id.as_str()).copied().unwrap_or(2);
                delivery_from_entry(entry, count)
            })
            .collect();

        Ok(deliveries)
    }
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn declare(&mut self, queue: &QueueSpec) -> Result<(), TransportError> {
        let created: Result<(), redis::RedisError> = self
            .conn
            .xgroup_create_mkstream(&queue.name, &queue.group, "0")
            .await;

        match created {
            Ok(()) => {
                tracing::debug!(queue = %queue.name, group = %queue.group, "Queue declared");
            }
            // Another worker or process declared it first.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(classify(e, ErrorKind::Consume)),
        }

        self.queue = Some(queue.clone());
        Ok(())
    }

    async fn fetch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let mut out = self.reclaim(max).await?;
        if out.len() >= max {
            return Ok(out);
        }

        let spec = self.queue()?.clone();
        let mut opts = StreamReadOptions::default()
            .group(&spec.group, &self.consumer)
            .count(max - out.len());
        // Only block when the reclaim pass produced nothing; BLOCK with work
        // already in hand would just add latency.
        if out.is_empty() {
            opts = opts.block(wait.as_millis() as usize);
        }

        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&spec.name], &[">"], &opts)
            .await
            .map_err(|e| classify(e, ErrorKind::Consume))?;

        for key in &reply.keys {
            for entry in &key.ids {
                match delivery_from_entry(entry, 1) {
                    Some(d) => out.push(d),
                    None => {
                        tracing::warn!(
                            message_id = %entry.id,
                            "Stream entry without a payload field, discarding"
                        );
                        let _: Result<u64, _> = self
                            .conn
                            .xack(&spec.name, &spec.group, &[&entry.id])
                            .await;
                    }
                }
            }
        }

        Ok(out)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let spec = self.queue()?.clone();
        let _: u64 = self
            .conn
            .xack(&spec.name, &spec.group, &[&delivery.message_id])
            .await
            .map_err(|e| classify(e, ErrorKind::Ack))?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let spec = self.queue()?.clone();
        if requeue {
            // Leaving the entry in the pending list is the requeue: it is
            // redelivered by the reclaim pass once requeue_idle elapses.
            tracing::debug!(
                message_id = %delivery.message_id,
                delivery_count = delivery.delivery_count,
                "Delivery left pending for redelivery"
            );
            return Ok(());
        }

        let _: u64 = self
            .conn
            .xack(&spec.name, &spec.group, &[&delivery.message_id])
            .await
            .map_err(|e| classify(e, ErrorKind::Ack))?;
        Ok(())
    }

    async fn park(&mut self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        let spec = self.queue()?.clone();

        let _: String = self
            .conn
            .xadd(
                &spec.parking,
                "*",
                &[
                    (PAYLOAD_FIELD, delivery.payload.as_slice()),
                    ("reason", reason.as_bytes()),
                    ("failed_at", chrono::Utc::now().to_rfc3339().as_bytes()),
                    ("source_id", delivery.message_id.as_bytes()),
                ],
            )
            .await
            .map_err(|e| classify(e, ErrorKind::Publish))?;

        let _: u64 = self
            .conn
            .xack(&spec.name, &spec.group, &[&delivery.message_id])
            .await
            .map_err(|e| classify(e, ErrorKind::Ack))?;

        tracing::info!(
            message_id = %delivery.message_id,
            parking = %spec.parking,
            reason,
            "Delivery parked"
        );
        Ok(())
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<String, TransportError> {
        let spec = self.queue()?.clone();
        let entry = [(PAYLOAD_FIELD, payload)];

        let id: String = match spec.max_length {
            Some(max) => self
                .conn
                .xadd_maxlen(&spec.name, StreamMaxlen::Approx(max as usize), "*", &entry)
                .await
                .map_err(|e| classify(e, ErrorKind::Publish))?,
            None => self
                .conn
                .xadd(&spec.name, "*", &entry)
                .await
                .map_err(|e| classify(e, ErrorKind::Publish))?,
        };

        Ok(id)
    }

    async fn close(&mut self) {
        self.open = false;
    }
}
