//! Session registry — who is connected right now, and how to reach them.
//!
//! An explicit, independently owned capability injected into the hub layer.
//! The hub registers a sender when a client session opens and unregisters it
//! on close; the pipeline only ever reads.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use courier_common::types::Notification;

/// Push side of one connected client session.
pub type SessionSender = mpsc::UnboundedSender<Arc<Notification>>;

/// Opaque handle identifying one registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

/// Per-recipient map of live sessions.
///
/// Thread-safe and cloneable via `Arc`. A recipient may hold any number of
/// concurrent sessions (multiple tabs, devices); each gets its own sender.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, HashMap<SessionId, SessionSender>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `user_id`. Returns the handle the hub layer
    /// passes back to [`unregister`](Self::unregister) on disconnect.
    pub async fn register(&self, user_id: &str, sender: SessionSender) -> SessionId {
        let id = SessionId(Uuid::new_v4());
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(id, sender);
        id
    }

    /// Remove a session. Unknown handles are a no-op.
    pub async fn unregister(&self, user_id: &str, session_id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(per_user) = sessions.get_mut(user_id) {
            per_user.remove(&session_id);
            if per_user.is_empty() {
                sessions.remove(user_id);
            }
        }
    }

    /// Snapshot of the live senders for a recipient.
    pub async fn sessions_for(&self, user_id: &str) -> Vec<(SessionId, SessionSender)> {
        let sessions = self.sessions.read().await;
        sessions
            .get(user_id)
            .map(|per_user| {
                per_user
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live sessions for a recipient.
    pub async fn session_count(&self, user_id: &str) -> usize {
        let sessions = self.sessions.read().await;
        sessions.get(user_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = registry.register("u1", tx).await;
        assert_eq!(registry.session_count("u1").await, 1);

        registry.unregister("u1", id).await;
        assert_eq!(registry.session_count("u1").await, 0);
    }

    #[tokio::test]
    async fn test_sessions_for_unknown_user_is_empty() {
        let registry = SessionRegistry::new();
        assert!(registry.sessions_for("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_user() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        registry.register("u1", tx1).await;
        registry.register("u1", tx2).await;
        assert_eq!(registry.session_count("u1").await, 2);
        assert_eq!(registry.sessions_for("u1").await.len(), 2);
    }
}
