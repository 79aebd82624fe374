use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Category of a notification.
///
/// Producers send either a name (`"task_assigned"`, `"TaskAssigned"`) or a
/// legacy integer code. Values this build does not know are preserved as
/// [`NotificationKind::Other`] so that new categories never break
/// deserialization of in-flight messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Comment,
    Mention,
    TaskAssigned,
    TaskUpdated,
    TaskCompleted,
    Reminder,
    Message,
    /// Unrecognized category, original wire value retained.
    Other(String),
}

impl NotificationKind {
    /// Parse a wire name. Case and `_`/`-` separators are ignored, so both
    /// `task_assigned` and `TaskAssigned` map to the same variant.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "comment" => NotificationKind::Comment,
            "mention" => NotificationKind::Mention,
            "taskassigned" => NotificationKind::TaskAssigned,
            "taskupdated" => NotificationKind::TaskUpdated,
            "taskcompleted" => NotificationKind::TaskCompleted,
            "reminder" => NotificationKind::Reminder,
            "message" => NotificationKind::Message,
            _ => NotificationKind::Other(raw.to_string()),
        }
    }

    /// Map a legacy integer code to its category.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => NotificationKind::Comment,
            1 => NotificationKind::Mention,
            2 => NotificationKind::TaskAssigned,
            3 => NotificationKind::TaskUpdated,
            4 => NotificationKind::TaskCompleted,
            5 => NotificationKind::Reminder,
            6 => NotificationKind::Message,
            other => NotificationKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Comment => write!(f, "comment"),
            NotificationKind::Mention => write!(f, "mention"),
            NotificationKind::TaskAssigned => write!(f, "task_assigned"),
            NotificationKind::TaskUpdated => write!(f, "task_updated"),
            NotificationKind::TaskCompleted => write!(f, "task_completed"),
            NotificationKind::Reminder => write!(f, "reminder"),
            NotificationKind::Message => write!(f, "message"),
            NotificationKind::Other(raw) => write!(f, "{}", raw),
        }
    }
}

impl Serialize for NotificationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NotificationKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(NotificationKind::parse(&s)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(NotificationKind::from_code)
                .ok_or_else(|| D::Error::custom("notification type code out of range")),
            other => Err(D::Error::custom(format!(
                "notification type must be a string or integer, got {other}"
            ))),
        }
    }
}

/// A notification as persisted and fanned out to sessions.
///
/// Immutable once stored, except for the read flag which is flipped by the
/// separate read API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Idempotency key for storage. Producer-assigned.
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    /// Originating business object, when there is one.
    pub related_entity_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

/// Raw queue payload published by producers.
///
/// Body contract: UTF-8 JSON
/// `{id?, userId, title, message, type: string|int, relatedJobId: string|null}`.
///
/// `id` is the producer-assigned idempotency key. Legacy producers omit it; a
/// fresh id is generated on receipt, at the cost of redelivery dedup for
/// those messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub user_id: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default)]
    pub related_job_id: Option<String>,
}

/// Why an inbound payload was rejected.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or empty required field: {field}")]
    EmptyField { field: &'static str },
}

impl NotificationEvent {
    /// Deserialize and validate a raw queue payload.
    ///
    /// Serde already rejects payloads with absent required fields; this adds
    /// the non-empty checks for `userId`, `title`, and `message`.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, EventError> {
        let event: NotificationEvent = serde_json::from_slice(payload)?;

        if event.user_id.trim().is_empty() {
            return Err(EventError::EmptyField { field: "userId" });
        }
        if event.title.trim().is_empty() {
            return Err(EventError::EmptyField { field: "title" });
        }
        if event.message.trim().is_empty() {
            return Err(EventError::EmptyField { field: "message" });
        }

        Ok(event)
    }

    /// Build the durable notification for this event.
    pub fn into_notification(self) -> Notification {
        Notification {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            user_id: self.user_id,
            title: self.title,
            message: self.message,
            kind: self.kind,
            related_entity_id: self.related_job_id,
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of the supervised broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Fast retries exhausted; reconnecting on the slow fixed interval.
    Degraded,
    ShuttingDown,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
            ConnectionState::ShuttingDown => write!(f, "shutting_down"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_snake_case() {
        assert_eq!(
            NotificationKind::parse("task_assigned"),
            NotificationKind::TaskAssigned
        );
        assert_eq!(NotificationKind::parse("comment"), NotificationKind::Comment);
    }

    #[test]
    fn test_kind_parse_pascal_case() {
        assert_eq!(
            NotificationKind::parse("TaskCompleted"),
            NotificationKind::TaskCompleted
        );
        assert_eq!(NotificationKind::parse("Mention"), NotificationKind::Mention);
    }

    #[test]
    fn test_kind_unknown_preserved() {
        assert_eq!(
            NotificationKind::parse("billing_receipt"),
            NotificationKind::Other("billing_receipt".to_string())
        );
    }

    #[test]
    fn test_kind_from_code() {
        assert_eq!(NotificationKind::from_code(5), NotificationKind::Reminder);
        assert_eq!(
            NotificationKind::from_code(42),
            NotificationKind::Other("42".to_string())
        );
    }

    #[test]
    fn test_kind_deserializes_from_string_and_int() {
        let from_str: NotificationKind = serde_json::from_value(serde_json::json!("reminder")).unwrap();
        let from_int: NotificationKind = serde_json::from_value(serde_json::json!(5)).unwrap();
        assert_eq!(from_str, NotificationKind::Reminder);
        assert_eq!(from_int, NotificationKind::Reminder);
    }

    #[test]
    fn test_kind_rejects_non_scalar() {
        let result: Result<NotificationKind, _> =
            serde_json::from_value(serde_json::json!({"name": "comment"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_event_from_bytes_valid() {
        let payload = serde_json::json!({
            "userId": "u1",
            "title": "T",
            "message": "M",
            "type": "Reminder",
            "relatedJobId": null
        });
        let event = NotificationEvent::from_bytes(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.kind, NotificationKind::Reminder);
        assert!(event.related_job_id.is_none());
    }

    #[test]
    fn test_event_missing_user_id_is_json_error() {
        let payload = serde_json::json!({"title": "T", "message": "M", "type": 0});
        let result = NotificationEvent::from_bytes(payload.to_string().as_bytes());
        assert!(matches!(result, Err(EventError::Json(_))));
    }

    #[test]
    fn test_event_empty_title_rejected() {
        let payload = serde_json::json!({
            "userId": "u1",
            "title": "   ",
            "message": "M",
            "type": "comment"
        });
        let result = NotificationEvent::from_bytes(payload.to_string().as_bytes());
        assert!(matches!(
            result,
            Err(EventError::EmptyField { field: "title" })
        ));
    }

    #[test]
    fn test_into_notification_generates_id_when_absent() {
        let payload = serde_json::json!({
            "userId": "u1",
            "title": "T",
            "message": "M",
            "type": "message"
        });
        let event = NotificationEvent::from_bytes(payload.to_string().as_bytes()).unwrap();
        let notification = event.into_notification();
        assert!(!notification.is_read);
        assert_eq!(notification.user_id, "u1");
    }

    #[test]
    fn test_into_notification_keeps_producer_id() {
        let id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": id,
            "userId": "u1",
            "title": "T",
            "message": "M",
            "type": "mention",
            "relatedJobId": "job-7"
        });
        let event = NotificationEvent::from_bytes(payload.to_string().as_bytes()).unwrap();
        let notification = event.into_notification();
        assert_eq!(notification.id, id);
        assert_eq!(notification.related_entity_id.as_deref(), Some("job-7"));
    }
}
