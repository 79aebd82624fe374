//! Durable notification storage.
//!
//! Writes are idempotent upserts keyed by notification id, so concurrent
//! workers and broker redeliveries are safe without any cross-resource
//! transaction: persisting the same id twice is success, not error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use courier_common::types::{Notification, NotificationKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage boundary consumed by the message processor.
#[async_trait]
pub trait NotificationStore: Send + Sync + 'static {
    /// Persist a notification. Returns `Ok(false)` when a row with the same
    /// id already exists — a successful outcome, not an error.
    async fn insert(&self, notification: &Notification) -> Result<bool, StoreError>;

    /// Load a notification by id.
    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>, StoreError>;

    /// Total persisted notifications for a recipient.
    async fn count_for_user(&self, user_id: &str) -> Result<i64, StoreError>;
}

/// Postgres-backed store.
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, title, message, kind, related_entity_id, is_read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(&notification.user_id)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.kind.to_string())
        .bind(&notification.related_entity_id)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        type Row = (
            Uuid,
            String,
            String,
            String,
            String,
            Option<String>,
            bool,
            chrono::DateTime<chrono::Utc>,
        );

        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT id, user_id, title, message, kind, related_entity_id, is_read, created_at
            FROM notifications
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, user_id, title, message, kind, related_entity_id, is_read, created_at)| {
                Notification {
                    id,
                    user_id,
                    title,
                    message,
                    kind: NotificationKind::parse(&kind),
                    related_entity_id,
                    is_read,
                    created_at,
                }
            },
        ))
    }

    async fn count_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }
}

/// In-memory store used by tests. `set_fail` simulates storage outages.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail until cleared.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("storage offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&notification.id) {
            return Ok(false);
        }
        rows.insert(notification.id, notification.clone());
        Ok(true)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        self.check_available()?;
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn count_for_user(&self, user_id: &str) -> Result<i64, StoreError> {
        self.check_available()?;
        let rows = self.rows.lock().await;
        Ok(rows.values().filter(|n| n.user_id == user_id).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_notification(id: Uuid) -> Notification {
        Notification {
            id,
            user_id: "u1".to_string(),
            title: "T".to_string(),
            message: "M".to_string(),
            kind: NotificationKind::Comment,
            related_entity_id: None,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_idempotent_insert() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        assert!(store.insert(&make_notification(id)).await.unwrap());
        assert!(!store.insert(&make_notification(id)).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail(true);
        let result = store.insert(&make_notification(Uuid::new_v4())).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        store.set_fail(false);
        assert!(store.insert(&make_notification(Uuid::new_v4())).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_count_for_user() {
        let store = MemoryStore::new();
        store.insert(&make_notification(Uuid::new_v4())).await.unwrap();
        store.insert(&make_notification(Uuid::new_v4())).await.unwrap();

        let mut other = make_notification(Uuid::new_v4());
        other.user_id = "u2".to_string();
        store.insert(&other).await.unwrap();

        assert_eq!(store.count_for_user("u1").await.unwrap(), 2);
        assert_eq!(store.count_for_user("u2").await.unwrap(), 1);
    }
}
