//! Delivery channels.
//!
//! - Live push to every connection of an online user (Redis pub/sub)
//! - Email fallback (Resend HTTP API)
//!
//! [`DeliveryRouter`] picks the route per notification from presence.

mod email;
mod memory;
mod push;

pub use email::{EmailMessage, ResendEmailTransport};
pub use memory::{RecordingEmailTransport, RecordingPushTransport};
pub use push::{PushPayload, RedisPushTransport};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use herald_common::presence::PresenceRegistry;
use herald_common::types::{DeliveryRoute, Notification};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Nobody is listening on the connection's channel any more.
    #[error("connection {0} is gone")]
    ConnectionGone(String),

    /// The notification cannot be delivered by any configured channel.
    #[error("no delivery route: {0}")]
    NoRoute(String),

    /// The channel refused the recipient or the message.
    #[error("rejected by channel: {0}")]
    Rejected(String),

    /// Temporary transport or infrastructure failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Sends a payload to one live connection.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, connection_id: &str, payload: &PushPayload) -> Result<(), DeliveryError>;
}

/// Sends one rendered email.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// Chooses between live push and email for each notification.
pub struct DeliveryRouter {
    presence: PresenceRegistry,
    push: Arc<dyn PushTransport>,
    email: Option<Arc<dyn EmailTransport>>,
}

impl DeliveryRouter {
    pub fn new(
        presence: PresenceRegistry,
        push: Arc<dyn PushTransport>,
        email: Option<Arc<dyn EmailTransport>>,
    ) -> Self {
        Self {
            presence,
            push,
            email,
        }
    }

    /// Push to every live connection of the user; fall back to email when the
    /// user is offline or no connection took the push.
    pub async fn deliver(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<DeliveryRoute, DeliveryError> {
        let connections = self
            .presence
            .connections_of(&notification.user_id)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        if !connections.is_empty() {
            let payload = PushPayload::from(notification);
            let mut delivered = 0usize;

            for connection_id in &connections {
                match self.push.send(connection_id, &payload).await {
                    Ok(()) => delivered += 1,
                    Err(DeliveryError::ConnectionGone(_)) => {
                        tracing::info!(
                            user_id = %notification.user_id,
                            connection_id = %connection_id,
                            "Dropping stale connection"
                        );
                        if let Err(e) = self.presence.disconnect(connection_id).await {
                            tracing::warn!(connection_id = %connection_id, error = %e, "Failed to drop stale connection");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            notification_id = %notification.id,
                            connection_id = %connection_id,
                            error = %e,
                            "Push failed"
                        );
                    }
                }
            }

            if delivered > 0 {
                tracing::debug!(
                    notification_id = %notification.id,
                    connections = delivered,
                    "Delivered via push"
                );
                return Ok(DeliveryRoute::Push);
            }
        }

        self.send_email(notification, now).await?;
        Ok(DeliveryRoute::Email)
    }

    async fn send_email(
        &self,
        notification: &Notification,
        now: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        let Some(transport) = &self.email else {
            return Err(DeliveryError::NoRoute(
                "user is offline and email is not configured".to_string(),
            ));
        };
        if notification.user_email.trim().is_empty() {
            return Err(DeliveryError::NoRoute(
                "user is offline and has no email address".to_string(),
            ));
        }

        let message = EmailMessage::render(notification, now);
        transport.send(&message).await?;
        tracing::debug!(notification_id = %notification.id, "Delivered via email");
        Ok(())
    }
}
