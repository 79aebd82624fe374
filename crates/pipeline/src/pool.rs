//! Consumer pool.
//!
//! A fixed set of worker loops, each consuming the shared durable queue
//! through its own channel leased from the supervisor's connection. Workers
//! never process while disconnected: they park on the supervisor's status
//! channel and rebuild their channel every time the connection cycles.
//!
//! With `W` workers each fetching at most `prefetch` deliveries before
//! settling them, outstanding unacknowledged messages never exceed
//! `W * prefetch`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_gateway::DeliveryGateway;
use courier_transport::{BrokerChannel, BrokerConnection, QueueSpec, Transport};

use crate::processor::{Outcome, Processor};
use crate::store::NotificationStore;
use crate::supervisor::Supervisor;

/// How long one fetch blocks waiting for a delivery. Also the worst-case
/// extra latency before a worker notices shutdown.
const FETCH_WAIT: Duration = Duration::from_millis(500);

/// Pause after a transient (non-connection) failure before retrying.
const ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub queue: QueueSpec,
    pub workers: usize,
    pub prefetch: usize,
}

/// Handle over the running worker set.
pub struct ConsumerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConsumerPool {
    /// Spawn the workers. They begin consuming once the supervisor reports
    /// `Connected`.
    pub fn start<T, S, G>(
        supervisor: Arc<Supervisor<T>>,
        processor: Arc<Processor<S, G>>,
        config: PoolConfig,
    ) -> Self
    where
        T: Transport,
        S: NotificationStore,
        G: DeliveryGateway,
    {
        let (shutdown_tx, _) = watch::channel(false);
        let handles = (0..config.workers)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&supervisor),
                    Arc::clone(&processor),
                    config.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        tracing::info!(
            workers = config.workers,
            prefetch = config.prefetch,
            queue = %config.queue.name,
            "Consumer pool started"
        );

        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Stop accepting new deliveries, let in-flight ones finish within
    /// `drain_timeout`, then abort stragglers. Worker channels are closed
    /// here, before the caller closes the shared connection.
    pub async fn shutdown(self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + drain_timeout;
        for (worker, mut handle) in self.handles.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                tracing::warn!(worker, "Worker did not drain in time, aborting");
                handle.abort();
            }
        }

        tracing::info!("Consumer pool stopped");
    }
}

async fn worker_loop<T, S, G>(
    worker: usize,
    supervisor: Arc<Supervisor<T>>,
    processor: Arc<Processor<S, G>>,
    config: PoolConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    T: Transport,
    S: NotificationStore,
    G: DeliveryGateway,
{
    let mut status_rx = supervisor.subscribe();

    'session: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let ready = tokio::select! {
            result = status_rx.wait_for(|s| s.is_connected()) => result.is_ok(),
            _ = shutdown_rx.changed() => continue 'session,
        };
        if !ready {
            // Status channel gone: the supervisor itself was dropped.
            break;
        }

        let Some(conn) = supervisor.connection().await else {
            continue 'session;
        };

        let mut channel = match conn.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(worker, error = %e, "Failed to lease channel");
                if e.is_connection_loss() {
                    supervisor.report_connection_lost(&conn).await;
                }
                tokio::time::sleep(ERROR_PAUSE).await;
                continue 'session;
            }
        };

        if let Err(e) = channel.declare(&config.queue).await {
            tracing::warn!(worker, error = %e, "Queue declare failed");
            if e.is_connection_loss() {
                supervisor.report_connection_lost(&conn).await;
            }
            channel.close().await;
            tokio::time::sleep(ERROR_PAUSE).await;
            continue 'session;
        }

        tracing::debug!(worker, queue = %config.queue.name, "Worker consuming");

        loop {
            if *shutdown_rx.borrow() {
                channel.close().await;
                break 'session;
            }

            let batch = match channel.fetch(config.prefetch, FETCH_WAIT).await {
                Ok(batch) => batch,
                Err(e) if e.is_connection_loss() => {
                    tracing::warn!(worker, error = %e, "Channel lost, waiting for reconnect");
                    supervisor.report_connection_lost(&conn).await;
                    channel.close().await;
                    continue 'session;
                }
                Err(e) => {
                    tracing::warn!(worker, error = %e, "Fetch failed, retrying");
                    tokio::time::sleep(ERROR_PAUSE).await;
                    continue;
                }
            };

            // Deliveries already fetched are settled even if shutdown lands
            // mid-batch; the pool's drain timeout bounds how long that takes.
            for delivery in batch {
                let outcome = processor.process(&delivery).await;
                let settled = match outcome {
                    Outcome::Ack => channel.ack(&delivery).await,
                    Outcome::Requeue => channel.nack(&delivery, true).await,
                    Outcome::Park { reason } => channel.park(&delivery, &reason).await,
                };

                if let Err(e) = settled {
                    tracing::warn!(
                        worker,
                        message_id = %delivery.message_id,
                        error = %e,
                        "Failed to settle delivery"
                    );
                    if e.is_connection_loss() {
                        supervisor.report_connection_lost(&conn).await;
                        channel.close().await;
                        continue 'session;
                    }
                }
            }
        }
    }

    tracing::debug!(worker, "Worker stopped");
}
