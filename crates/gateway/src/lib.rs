//! Real-time delivery gateway.
//!
//! Best-effort push of persisted notifications to whichever sessions are
//! currently registered for a recipient. The persisted record is the durable
//! source of truth; a recipient with no live session catches up through the
//! pull API when they reconnect, so an undeliverable push is never an error.

pub mod registry;

pub use registry::{SessionId, SessionRegistry, SessionSender};

use std::sync::Arc;

use async_trait::async_trait;

use courier_common::types::Notification;

/// Fan-out boundary consumed by the message processor.
#[async_trait]
pub trait DeliveryGateway: Send + Sync + 'static {
    /// Push `notification` to every live session of `user_id`.
    ///
    /// Fire-and-forget: no retries, no persistence. Returns how many
    /// sessions were reached; zero is a normal outcome.
    async fn deliver(&self, user_id: &str, notification: &Notification) -> usize;
}

/// Registry-backed gateway.
pub struct SessionGateway {
    registry: Arc<SessionRegistry>,
}

impl SessionGateway {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliveryGateway for SessionGateway {
    async fn deliver(&self, user_id: &str, notification: &Notification) -> usize {
        let sessions = self.registry.sessions_for(user_id).await;
        if sessions.is_empty() {
            tracing::debug!(user_id, notification_id = %notification.id, "No live sessions");
            return 0;
        }

        let payload = Arc::new(notification.clone());
        let mut delivered = 0;

        for (session_id, sender) in sessions {
            if sender.send(Arc::clone(&payload)).is_ok() {
                delivered += 1;
            } else {
                // Receiver dropped without unregistering; prune it.
                tracing::debug!(user_id, ?session_id, "Pruning dead session");
                self.registry.unregister(user_id, session_id).await;
            }
        }

        tracing::debug!(
            user_id,
            notification_id = %notification.id,
            delivered,
            "Notification pushed"
        );
        delivered
    }
}
