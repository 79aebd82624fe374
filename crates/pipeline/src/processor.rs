//! Message processor.
//!
//! Turns a raw delivery into a durable, delivered notification. The order of
//! effects is the durability contract: persist, then fan out, then let the
//! worker acknowledge. Acking before the persist succeeded would lose the
//! message if the process died in between.
//!
//! Every failure is converted into an outcome; nothing thrown here may take
//! a worker loop down with it.

use std::sync::Arc;

use courier_common::types::NotificationEvent;
use courier_gateway::DeliveryGateway;
use courier_transport::Delivery;

use crate::store::NotificationStore;

/// How much of a bad payload lands in the log.
const PAYLOAD_LOG_LIMIT: usize = 256;

/// What the worker should do with the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Persisted (or already persisted); settle the message.
    Ack,
    /// Transient failure; give the message back for another attempt.
    Requeue,
    /// Unprocessable or out of attempts; move to the parking queue.
    Park { reason: String },
}

pub struct Processor<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    max_delivery_attempts: u32,
}

impl<S: NotificationStore, G: DeliveryGateway> Processor<S, G> {
    pub fn new(store: Arc<S>, gateway: Arc<G>, max_delivery_attempts: u32) -> Self {
        Self {
            store,
            gateway,
            max_delivery_attempts,
        }
    }

    /// Process one delivery: deserialize, validate, persist, fan out.
    pub async fn process(&self, delivery: &Delivery) -> Outcome {
        let event = match NotificationEvent::from_bytes(&delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                let snippet = payload_snippet(&delivery.payload);
                tracing::warn!(
                    message_id = %delivery.message_id,
                    error = %e,
                    payload = %snippet,
                    "Rejecting malformed notification payload"
                );
                // Requeueing a poison message would just burn prefetch slots
                // on every worker in turn.
                return Outcome::Park {
                    reason: e.to_string(),
                };
            }
        };

        let notification = event.into_notification();

        match self.store.insert(&notification).await {
            Ok(inserted) => {
                if !inserted {
                    tracing::debug!(
                        notification_id = %notification.id,
                        "Notification already persisted, redelivery absorbed"
                    );
                }

                // Best-effort push. The persisted row is the source of truth;
                // recipients without a live session catch up via the pull API.
                let delivered = self
                    .gateway
                    .deliver(&notification.user_id, &notification)
                    .await;

                tracing::info!(
                    notification_id = %notification.id,
                    user_id = %notification.user_id,
                    kind = %notification.kind,
                    delivered,
                    "Notification processed"
                );
                Outcome::Ack
            }
            Err(e) => {
                if delivery.delivery_count >= self.max_delivery_attempts {
                    tracing::error!(
                        message_id = %delivery.message_id,
                        notification_id = %notification.id,
                        delivery_count = delivery.delivery_count,
                        error = %e,
                        "Persistence failed on final delivery attempt, parking"
                    );
                    Outcome::Park {
                        reason: format!(
                            "persistence failed after {} deliveries: {}",
                            delivery.delivery_count, e
                        ),
                    }
                } else {
                    tracing::warn!(
                        message_id = %delivery.message_id,
                        notification_id = %notification.id,
                        delivery_count = delivery.delivery_count,
                        error = %e,
                        "Persistence failed, requeueing"
                    );
                    Outcome::Requeue
                }
            }
        }
    }
}

fn payload_snippet(payload: &[u8]) -> String {
    let end = payload.len().min(PAYLOAD_LOG_LIMIT);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}
