//! In-process broker used by tests.
//!
//! Models the parts of the real broker the pipeline depends on: a single
//! durable queue with pending-entry tracking, per-delivery counts, a parking
//! queue, and connection loss. Failure injection (refused connects, auth
//! rejections, forced disconnects) drives the supervisor and pool tests.
//!
//! Unlike the Redis transport, a nack-with-requeue here makes the message
//! immediately fetchable again, so redelivery tests need no idle timers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::{BrokerChannel, BrokerConnection, Delivery, QueueSpec, Transport};

/// Poll granularity for blocking fetches and `closed()` waits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct StoredMessage {
    id: String,
    payload: Vec<u8>,
    deliveries: u32,
}

/// A message routed to the parking queue.
#[derive(Debug, Clone)]
pub struct ParkedMessage {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    declares: u32,
    max_length: Option<u64>,
    ready: VecDeque<StoredMessage>,
    pending: HashMap<String, StoredMessage>,
    acked: Vec<String>,
    parked: Vec<ParkedMessage>,
    seq: u64,
    unacked_high_water: usize,
}

impl QueueState {
    fn next_id(&mut self) -> String {
        self.seq += 1;
        format!("mem-{}", self.seq)
    }

    fn enqueue(&mut self, payload: Vec<u8>) -> String {
        if let Some(max) = self.max_length {
            while self.ready.len() as u64 >= max {
                self.ready.pop_front();
            }
        }
        let id = self.next_id();
        self.ready.push_back(StoredMessage {
            id: id.clone(),
            payload,
            deliveries: 0,
        });
        id
    }
}

struct BrokerInner {
    state: Mutex<QueueState>,
    arrivals: Notify,
    drops: Notify,
    connect_attempts: AtomicU32,
    fail_connect: AtomicBool,
    fail_auth: AtomicBool,
    /// Last issued connection generation.
    generation: AtomicU64,
    /// Generations at or below this are dead.
    killed: AtomicU64,
}

impl BrokerInner {
    fn is_live(&self, generation: u64) -> bool {
        self.killed.load(Ordering::SeqCst) < generation
    }
}

/// Shared in-memory broker. Clone it to keep a test-side control handle.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(QueueState::default()),
                arrivals: Notify::new(),
                drops: Notify::new(),
                connect_attempts: AtomicU32::new(0),
                fail_connect: AtomicBool::new(false),
                fail_auth: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                killed: AtomicU64::new(0),
            }),
        }
    }

    /// Make subsequent connect attempts fail with a network-style error.
    pub fn set_fail_connect(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent connect attempts fail as credential rejections.
    pub fn set_fail_auth(&self, fail: bool) {
        self.inner.fail_auth.store(fail, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Kill every live connection: channel operations start failing,
    /// `closed()` resolves, and unacked deliveries go back to the queue
    /// the way a broker redelivers after a consumer dies.
    pub async fn drop_connections(&self) {
        let current = self.inner.generation.load(Ordering::SeqCst);
        self.inner.killed.store(current, Ordering::SeqCst);

        let mut state = self.inner.state.lock().await;
        let pending: Vec<String> = state.pending.keys().cloned().collect();
        for id in pending {
            if let Some(msg) = state.pending.remove(&id) {
                state.ready.push_front(msg);
            }
        }
        drop(state);

        self.inner.drops.notify_waiters();
        self.inner.arrivals.notify_waiters();
    }

    /// Enqueue a payload directly, as an external producer would.
    pub async fn publish_raw(&self, payload: &[u8]) -> String {
        let id = {
            let mut state = self.inner.state.lock().await;
            state.enqueue(payload.to_vec())
        };
        self.inner.arrivals.notify_waiters();
        id
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.state.lock().await.ready.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.inner.state.lock().await.acked.clone()
    }

    pub async fn parked(&self) -> Vec<ParkedMessage> {
        self.inner.state.lock().await.parked.clone()
    }

    /// Highest number of simultaneously unacknowledged deliveries observed.
    pub async fn unacked_high_water(&self) -> usize {
        self.inner.state.lock().await.unacked_high_water
    }

    pub async fn declare_count(&self) -> u32 {
        self.inner.state.lock().await.declares
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<Self::Connection, TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.inner.fail_auth.load(Ordering::SeqCst) {
            return Err(TransportError::auth("access denied"));
        }
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::connect("connection refused"));
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryConnection {
            inner: Arc::clone(&self.inner),
            generation,
        })
    }
}

pub struct MemoryConnection {
    inner: Arc<BrokerInner>,
    generation: u64,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("generation", &self.generation)
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<Self::Channel, TransportError> {
        if !self.inner.is_live(self.generation) {
            return Err(TransportError::channel_closed("connection is gone"));
        }
        Ok(MemoryChannel {
            inner: Arc::clone(&self.inner),
            generation: self.generation,
            open: true,
        })
    }

    async fn closed(&self) {
        loop {
            if !self.inner.is_live(self.generation) {
                return;
            }
            tokio::select! {
                _ = self.inner.drops.notified() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn close(&self) {
        self.inner
            .killed
            .fetch_max(self.generation, Ordering::SeqCst);
        self.inner.drops.notify_waiters();
    }
}

pub struct MemoryChannel {
    inner: Arc<BrokerInner>,
    generation: u64,
    open: bool,
}

impl MemoryChannel {
    fn ensure_live(&self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::channel_closed("channel is closed"));
        }
        if !self.inner.is_live(self.generation) {
            return Err(TransportError::channel_closed("connection is gone"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare(&mut self, queue: &QueueSpec) -> Result<(), TransportError> {
        self.ensure_live()?;
        let mut state = self.inner.state.lock().await;
        // Concurrent declares are expected; the queue simply already exists.
        state.declares += 1;
        state.max_length = queue.max_length;
        Ok(())
    }

    async fn fetch(
        &mut self,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_live()?;

            {
                let mut state = self.inner.state.lock().await;
                if !state.ready.is_empty() {
                    let mut out = Vec::new();
                    while out.len() < max {
                        let Some(mut msg) = state.ready.pop_front() else {
                            break;
                        };
                        msg.deliveries += 1;
                        out.push(Delivery {
                            message_id: msg.id.clone(),
                            payload: msg.payload.clone(),
                            delivery_count: msg.deliveries,
                        });
                        state.pending.insert(msg.id.clone(), msg);
                    }
                    let outstanding = state.pending.len();
                    state.unacked_high_water = state.unacked_high_water.max(outstanding);
                    return Ok(out);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.inner.arrivals.notified() => {}
                _ = self.inner.drops.notified() => {}
                _ = tokio::time::sleep(remaining.min(POLL_INTERVAL)) => {}
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_live()?;
        let mut state = self.inner.state.lock().await;
        if state.pending.remove(&delivery.message_id).is_some() {
            state.acked.push(delivery.message_id.clone());
        }
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        self.ensure_live()?;
        let mut state = self.inner.state.lock().await;
        let Some(msg) = state.pending.remove(&delivery.message_id) else {
            return Ok(());
        };
        if requeue {
            state.ready.push_front(msg);
            drop(state);
            self.inner.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn park(&mut self, delivery: &Delivery, reason: &str) -> Result<(), TransportError> {
        self.ensure_live()?;
        let mut state = self.inner.state.lock().await;
        state.pending.remove(&delivery.message_id);
        state.parked.push(ParkedMessage {
            message_id: delivery.message_id.clone(),
            payload: delivery.payload.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<String, TransportError> {
        self.ensure_live()?;
        let id = {
            let mut state = self.inner.state.lock().await;
            state.enqueue(payload.to_vec())
        };
        self.inner.arrivals.notify_waiters();
        Ok(id)
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_channel(broker: &MemoryTransport) -> MemoryChannel {
        let conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        channel
            .declare(&QueueSpec::new("notifications", "courier"))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_fetch_ack_roundtrip() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;

        let id = channel.publish(b"hello").await.unwrap();
        let deliveries = channel.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, id);
        assert_eq!(deliveries[0].payload, b"hello");
        assert_eq!(deliveries[0].delivery_count, 1);

        channel.ack(&deliveries[0]).await.unwrap();
        assert_eq!(broker.acked().await, vec![id]);
        assert_eq!(broker.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_fetch_respects_prefetch_bound() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        for i in 0..5 {
            channel.publish(format!("m{i}").as_bytes()).await.unwrap();
        }

        let deliveries = channel.fetch(2, Duration::from_millis(50)).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(broker.queue_len().await, 3);
        assert_eq!(broker.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_nack_requeue_increments_delivery_count() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        channel.publish(b"retry me").await.unwrap();

        let first = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);
        channel.nack(&first[0], true).await.unwrap();

        let second = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        channel.publish(b"drop me").await.unwrap();

        let deliveries = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        channel.nack(&deliveries[0], false).await.unwrap();

        assert_eq!(broker.queue_len().await, 0);
        assert_eq!(broker.pending_len().await, 0);
        let fetched = channel.fetch(1, Duration::from_millis(20)).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[tokio::test]
    async fn test_park_moves_to_parking_queue() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        channel.publish(b"poison").await.unwrap();

        let deliveries = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        channel.park(&deliveries[0], "malformed payload").await.unwrap();

        let parked = broker.parked().await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].payload, b"poison");
        assert_eq!(parked[0].reason, "malformed payload");
        assert_eq!(broker.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_drop_connections_requeues_pending_and_kills_channel() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        channel.publish(b"inflight").await.unwrap();
        let deliveries = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(broker.pending_len().await, 1);

        broker.drop_connections().await;

        assert!(channel.ack(&deliveries[0]).await.is_err());
        assert_eq!(broker.queue_len().await, 1);

        // A fresh connection sees the redelivered message.
        let mut channel = connected_channel(&broker).await;
        let redelivered = channel.fetch(1, Duration::from_millis(50)).await.unwrap();
        assert_eq!(redelivered[0].payload, b"inflight");
        assert_eq!(redelivered[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let broker = MemoryTransport::new();
        broker.set_fail_connect(true);
        let err = broker.connect().await.unwrap_err();
        assert!(err.is_connection_loss());
        assert_eq!(broker.connect_attempts(), 1);

        broker.set_fail_connect(false);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_max_length_evicts_oldest() {
        let broker = MemoryTransport::new();
        let conn = broker.connect().await.unwrap();
        let mut channel = conn.open_channel().await.unwrap();
        channel
            .declare(
                &QueueSpec::new("notifications", "courier").with_max_length(Some(2)),
            )
            .await
            .unwrap();

        channel.publish(b"a").await.unwrap();
        channel.publish(b"b").await.unwrap();
        channel.publish(b"c").await.unwrap();

        assert_eq!(broker.queue_len().await, 2);
        let deliveries = channel.fetch(10, Duration::from_millis(50)).await.unwrap();
        let payloads: Vec<_> = deliveries.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let broker = MemoryTransport::new();
        let mut channel = connected_channel(&broker).await;
        let deliveries = channel.fetch(1, Duration::from_millis(30)).await.unwrap();
        assert!(deliveries.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_declare_tolerated() {
        let broker = MemoryTransport::new();
        let _a = connected_channel(&broker).await;
        let _b = connected_channel(&broker).await;
        assert_eq!(broker.declare_count().await, 2);
    }
}
