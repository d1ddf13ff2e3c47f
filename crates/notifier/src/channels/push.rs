use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::presence::push_channel;
use herald_common::types::Notification;

use super::{DeliveryError, PushTransport};

/// What a live connection receives for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl From<&Notification> for PushPayload {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            title: n.title.clone(),
            message: n.message.clone(),
            notification_type: n.notification_type.clone(),
            count: n.count,
            created_at: n.created_at,
            updated_at: n.updated_at,
            metadata: n.metadata.clone(),
        }
    }
}

/// Publishes pushes on `push:{connection_id}`; the API instance holding the
/// socket relays them.
#[derive(Clone)]
pub struct RedisPushTransport {
    redis: ConnectionManager,
}

impl RedisPushTransport {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PushTransport for RedisPushTransport {
    async fn send(&self, connection_id: &str, payload: &PushPayload) -> Result<(), DeliveryError> {
        let body =
            serde_json::to_string(payload).map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let mut redis = self.redis.clone();
        let receivers: i64 = redis
            .publish(push_channel(connection_id), body)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        if receivers == 0 {
            return Err(DeliveryError::ConnectionGone(connection_id.to_string()));
        }
        Ok(())
    }
}
