//! Connection supervisor.
//!
//! Owns the single logical broker connection. One long-lived supervising
//! task connects with backoff, publishes readiness over a watch channel,
//! then parks until the connection dies (broker-side close or a worker
//! report) and reconnects. After `max_fast_attempts` consecutive failures it
//! enters degraded mode and keeps retrying on the slow interval — a broker
//! outage stretches delivery latency, it never stops the service.
//!
//! Only this task mutates connection state, and the connect gate keeps at
//! most one attempt in flight even when external triggers race.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;

use courier_common::types::ConnectionState;
use courier_transport::{BrokerConnection, ErrorKind, Transport};

use crate::retry::RetryPolicy;

/// Snapshot of the supervised connection, published over a watch channel.
///
/// `detail` carries the last connect error, for logs and the health probe.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerStatus {
    pub state: ConnectionState,
    pub detail: Option<String>,
}

impl BrokerStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

struct Inner<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    status_tx: watch::Sender<BrokerStatus>,
    connection: RwLock<Option<Arc<T::Connection>>>,
    /// Serializes connect attempts.
    connect_gate: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    /// Workers signal here when their channel dies under them.
    lost: Notify,
}

/// Maintains exactly one active logical connection to the broker.
pub struct Supervisor<T: Transport> {
    inner: Arc<Inner<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

enum Wake {
    ConnectionLost(&'static str),
    Shutdown,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        let (status_tx, _) = watch::channel(BrokerStatus {
            state: ConnectionState::Disconnected,
            detail: None,
        });
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                transport,
                policy,
                status_tx,
                connection: RwLock::new(None),
                connect_gate: Mutex::new(()),
                shutdown_tx,
                lost: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Launch the supervising task. Idempotent: a no-op while the task is
    /// already connecting or connected, or after shutdown began.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            return;
        }
        if *self.inner.shutdown_tx.borrow() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run(inner)));
    }

    /// Observe connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<BrokerStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Current state snapshot.
    pub fn status(&self) -> BrokerStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// The active connection, if any. Workers derive their channels from it
    /// and must not hold it across reconnects.
    pub async fn connection(&self) -> Option<Arc<T::Connection>> {
        self.inner.connection.read().await.clone()
    }

    /// A worker observed a connection-level failure on `conn`. Reports
    /// against an already-replaced connection are ignored, so a burst of
    /// failures from every worker collapses into one reconnect.
    pub async fn report_connection_lost(&self, conn: &Arc<T::Connection>) {
        let current = self.inner.connection.read().await;
        if let Some(active) = current.as_ref()
            && Arc::ptr_eq(active, conn)
        {
            self.inner.lost.notify_one();
        }
    }

    /// Signal shutdown, wait up to `timeout` for the supervising task to
    /// observe it and wind down, then make sure the connection is closed.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.status_tx.send_modify(|status| {
            status.state = ConnectionState::ShuttingDown;
        });
        let _ = self.inner.shutdown_tx.send(true);

        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(timeout, &mut handle).await.is_err()
        {
            tracing::warn!("Supervising task did not stop within the timeout, aborting");
            handle.abort();
            if let Some(conn) = self.inner.connection.write().await.take() {
                conn.close().await;
            }
        }

        self.inner.status_tx.send_replace(BrokerStatus {
            state: ConnectionState::Closed,
            detail: None,
        });
        tracing::info!("Broker connection supervisor stopped");
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

async fn run<T: Transport>(inner: Arc<Inner<T>>) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let Some(conn) = connect_with_retry(&inner, &mut shutdown_rx).await else {
            break;
        };
        let conn = Arc::new(conn);
        *inner.connection.write().await = Some(Arc::clone(&conn));
        inner.status_tx.send_replace(BrokerStatus {
            state: ConnectionState::Connected,
            detail: None,
        });
        tracing::info!("Broker connection established");

        let wake = tokio::select! {
            _ = conn.closed() => Wake::ConnectionLost("closed by broker"),
            _ = inner.lost.notified() => Wake::ConnectionLost("reported by worker"),
            _ = wait_for_shutdown(&mut shutdown_rx) => Wake::Shutdown,
        };

        *inner.connection.write().await = None;

        match wake {
            Wake::Shutdown => {
                conn.close().await;
                break;
            }
            Wake::ConnectionLost(reason) => {
                tracing::warn!(reason, "Broker connection lost, reconnecting");
                inner.status_tx.send_replace(BrokerStatus {
                    state: ConnectionState::Disconnected,
                    detail: Some(reason.to_string()),
                });
            }
        }
    }

    inner.status_tx.send_replace(BrokerStatus {
        state: ConnectionState::Closed,
        detail: None,
    });
}

/// One serialized connect attempt loop. Returns `None` when shutdown was
/// requested before a connection could be made.
async fn connect_with_retry<T: Transport>(
    inner: &Arc<Inner<T>>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<T::Connection> {
    let _gate = inner.connect_gate.lock().await;
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return None;
        }

        let state = if inner.policy.is_degraded(attempt) {
            ConnectionState::Degraded
        } else {
            ConnectionState::Connecting
        };
        inner.status_tx.send_modify(|status| status.state = state);

        match inner.transport.connect().await {
            Ok(conn) => return Some(conn),
            Err(e) => {
                attempt += 1;
                if e.kind == ErrorKind::Auth {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "Broker rejected credentials; retrying under the standard backoff"
                    );
                } else {
                    tracing::warn!(attempt, error = %e, "Broker connect failed");
                }

                let state = if inner.policy.is_degraded(attempt) {
                    ConnectionState::Degraded
                } else {
                    ConnectionState::Connecting
                };
                if attempt == inner.policy.max_fast_attempts + 1 {
                    tracing::warn!(
                        interval_secs = inner.policy.degraded_interval.as_secs(),
                        "Fast retries exhausted, entering degraded mode"
                    );
                }
                inner.status_tx.send_replace(BrokerStatus {
                    state,
                    detail: Some(e.to_string()),
                });

                let delay = inner
                    .policy
                    .delay_for(attempt, e.kind)
                    .unwrap_or(inner.policy.base);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(shutdown_rx) => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_transport::MemoryTransport;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            max_fast_attempts: 2,
            degraded_interval: Duration::from_millis(30),
        }
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<BrokerStatus>,
        state: ConnectionState,
    ) -> BrokerStatus {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for state")
            .expect("status channel closed")
            .clone()
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let broker = MemoryTransport::new();
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        supervisor.start().await;
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        assert_eq!(broker.connect_attempts(), 1);
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reconnects_after_forced_drop() {
        let broker = MemoryTransport::new();
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        broker.drop_connections().await;
        wait_for_state(&mut rx, ConnectionState::Connected).await;

        assert!(broker.connect_attempts() >= 2);
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_degraded_after_fast_attempts_then_recovers() {
        let broker = MemoryTransport::new();
        broker.set_fail_connect(true);
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        let degraded = wait_for_state(&mut rx, ConnectionState::Degraded).await;
        assert!(degraded.detail.is_some());

        broker.set_fail_connect(false);
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_auth_failures_retried_like_connect_failures() {
        let broker = MemoryTransport::new();
        broker.set_fail_auth(true);
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.connect_attempts() >= 2, "auth failures must keep retrying");

        broker.set_fail_auth(false);
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_reconnect() {
        let broker = MemoryTransport::new();
        broker.set_fail_connect(true);
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        supervisor.stop(Duration::from_secs(1)).await;
        let status = rx.borrow().clone();
        assert_eq!(status.state, ConnectionState::Closed);

        // No further attempts once stopped.
        let attempts = broker.connect_attempts();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(broker.connect_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_stale_loss_report_ignored() {
        let broker = MemoryTransport::new();
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        let mut rx = supervisor.subscribe();

        supervisor.start().await;
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let first = supervisor.connection().await.unwrap();

        supervisor.report_connection_lost(&first).await;
        // The watch channel can collapse fast intermediate states, so wait
        // on the reconnect itself rather than on Disconnected.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.connect_attempts() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "no reconnect happened");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_for_state(&mut rx, ConnectionState::Connected).await;
        let attempts_after_cycle = broker.connect_attempts();

        // The old connection is no longer active; its report must not
        // trigger another cycle.
        supervisor.report_connection_lost(&first).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_attempts(), attempts_after_cycle);

        supervisor.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_start_after_stop_is_noop() {
        let broker = MemoryTransport::new();
        let supervisor = Supervisor::new(broker.clone(), fast_policy());
        supervisor.start().await;
        supervisor.stop(Duration::from_secs(1)).await;

        let attempts = broker.connect_attempts();
        supervisor.start().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(broker.connect_attempts(), attempts);
        assert_eq!(supervisor.status().state, ConnectionState::Closed);
    }
}
