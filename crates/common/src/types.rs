use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Namespace for aggregation keys derived from `user_id + type`.
const AGGREGATION_NAMESPACE: Uuid = Uuid::from_u128(0x5b0e_8c3e_41d7_4a6f_9d2c_7f31_a8e4_6c10);

/// Notification delivery status.
///
/// `Sent` and `DeadLetter` are terminal for the dispatcher; only a new
/// aggregated event moves a `Sent` record back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::DeadLetter)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

/// Channel a notification was delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryRoute {
    /// Live push to every connection of an online user.
    Push,
    /// Email fallback for offline users.
    Email,
}

impl std::fmt::Display for DeliveryRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryRoute::Push => write!(f, "push"),
            DeliveryRoute::Email => write!(f, "email"),
        }
    }
}

/// A raw notification event as published by producers onto the intake queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub user_id: String,
    #[serde(default)]
    pub user_email: String,
    pub title: String,
    pub message: String,
    /// Event category, e.g. `message`, `friend_request`, `system_alert`.
    #[serde(rename = "type", default)]
    pub notification_type: String,
    /// Groups related events into one evolving notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_key: Option<String>,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
    /// Number of times this message has been requeued by a consumer.
    #[serde(default)]
    pub retry_count: u32,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl NotificationEvent {
    /// Reject events no consumer could ever turn into a notification.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.user_id.trim().is_empty() {
            return Err(AppError::Validation("userId is required".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(AppError::Validation("title is required".to_string()));
        }
        if self.message.trim().is_empty() {
            return Err(AppError::Validation("message is required".to_string()));
        }
        Ok(())
    }

    /// The explicit aggregation key, or one derived from `user_id + type`.
    pub fn resolved_aggregation_key(&self) -> String {
        match self.aggregation_key.as_deref() {
            Some(key) if !key.trim().is_empty() => key.to_string(),
            _ => default_aggregation_key(&self.user_id, &self.notification_type),
        }
    }
}

/// Deterministic aggregation key for events that do not carry one.
pub fn default_aggregation_key(user_id: &str, notification_type: &str) -> String {
    let name = format!("{}:{}", user_id, notification_type);
    Uuid::new_v5(&AGGREGATION_NAMESPACE, name.as_bytes()).to_string()
}

/// A persisted notification: one record per open `(user_id, aggregation_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub aggregation_key: String,
    /// Number of coalesced events (>= 1, never decreases).
    pub count: i32,
    pub last_message_content: String,
    pub is_read: bool,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub delivered_via: Option<DeliveryRoute>,
    /// Identifies the dispatcher claim while `status == processing`.
    #[serde(skip)]
    pub lease_token: Option<Uuid>,
    /// Last aggregated change applied; replays of the same change are skipped.
    #[serde(skip)]
    pub last_change_id: Option<Uuid>,
}

/// Durable staging record for an internally produced event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            created_at: now,
            processed: false,
            processed_at: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Emitted through the outbox when a notification reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationLifecycleEvent {
    pub notification_id: Uuid,
    pub user_id: String,
    pub aggregation_key: String,
    pub status: NotificationStatus,
    pub delivered_via: Option<DeliveryRoute>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl NotificationLifecycleEvent {
    pub const SENT: &'static str = "notification.sent";
    pub const DEAD_LETTERED: &'static str = "notification.dead_lettered";

    /// Outbox event type for this transition, if the status is terminal.
    pub fn event_type(&self) -> Option<&'static str> {
        match self.status {
            NotificationStatus::Sent => Some(Self::SENT),
            NotificationStatus::DeadLetter => Some(Self::DEAD_LETTERED),
            _ => None,
        }
    }

    pub fn into_outbox_record(self) -> Result<Option<OutboxRecord>, AppError> {
        let Some(event_type) = self.event_type() else {
            return Ok(None);
        };
        let now = self.occurred_at;
        let payload = serde_json::to_value(&self)?;
        Ok(Some(OutboxRecord::new(event_type, payload, now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregation_key: Option<&str>) -> NotificationEvent {
        NotificationEvent {
            user_id: "u1".to_string(),
            user_email: "u1@example.com".to_string(),
            title: "T".to_string(),
            message: "m1".to_string(),
            notification_type: "x".to_string(),
            aggregation_key: aggregation_key.map(str::to_string),
            metadata: serde_json::json!({}),
            retry_count: 0,
        }
    }

    #[test]
    fn test_event_parses_wire_shape() {
        let raw = r#"{"userId":"u1","userEmail":"a@b.c","title":"T","message":"m","type":"x"}"#;
        let parsed: NotificationEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.user_id, "u1");
        assert_eq!(parsed.notification_type, "x");
        assert_eq!(parsed.aggregation_key, None);
        assert_eq!(parsed.retry_count, 0);
        assert_eq!(parsed.metadata, serde_json::json!({}));
    }

    #[test]
    fn test_default_key_is_deterministic_per_user_and_type() {
        let a = default_aggregation_key("u1", "x");
        assert_eq!(a, default_aggregation_key("u1", "x"));
        assert_ne!(a, default_aggregation_key("u1", "y"));
        assert_ne!(a, default_aggregation_key("u2", "x"));
    }

    #[test]
    fn test_blank_key_falls_back_to_derived() {
        let derived = default_aggregation_key("u1", "x");
        assert_eq!(event(None).resolved_aggregation_key(), derived);
        assert_eq!(event(Some("  ")).resolved_aggregation_key(), derived);
        assert_eq!(event(Some("thread-7")).resolved_aggregation_key(), "thread-7");
    }

    #[test]
    fn test_validate_requires_user_title_message() {
        assert!(event(None).validate().is_ok());

        let mut missing_user = event(None);
        missing_user.user_id = String::new();
        assert!(matches!(missing_user.validate(), Err(AppError::Validation(_))));

        let mut missing_message = event(None);
        missing_message.message = " ".to_string();
        assert!(missing_message.validate().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(NotificationStatus::Sent.is_terminal());
        assert!(NotificationStatus::DeadLetter.is_terminal());
        assert!(!NotificationStatus::Failed.is_terminal());
        assert!(!NotificationStatus::Processing.is_terminal());
        assert_eq!(NotificationStatus::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn test_lifecycle_event_only_for_terminal_status() {
        let mut lifecycle = NotificationLifecycleEvent {
            notification_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            aggregation_key: "k".to_string(),
            status: NotificationStatus::Failed,
            delivered_via: None,
            retry_count: 1,
            error_message: Some("smtp down".to_string()),
            occurred_at: Utc::now(),
        };
        assert!(lifecycle.clone().into_outbox_record().unwrap().is_none());

        lifecycle.status = NotificationStatus::DeadLetter;
        let record = lifecycle.into_outbox_record().unwrap().unwrap();
        assert_eq!(record.event_type, NotificationLifecycleEvent::DEAD_LETTERED);
        assert!(!record.processed);
        assert_eq!(record.payload["status"], "dead_letter");
    }
}
