//! Recording transports for single-process runs and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DeliveryError, EmailMessage, EmailTransport, PushPayload, PushTransport};

/// Push transport that delivers to connections registered with [`listen`].
///
/// [`listen`]: RecordingPushTransport::listen
#[derive(Default)]
pub struct RecordingPushTransport {
    listeners: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, PushPayload)>>,
}

impl RecordingPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn listen(&self, connection_id: &str) {
        self.listeners.lock().await.insert(connection_id.to_string());
    }

    pub async fn hang_up(&self, connection_id: &str) {
        self.listeners.lock().await.remove(connection_id);
    }

    pub async fn sent(&self) -> Vec<(String, PushPayload)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PushTransport for RecordingPushTransport {
    async fn send(&self, connection_id: &str, payload: &PushPayload) -> Result<(), DeliveryError> {
        if !self.listeners.lock().await.contains(connection_id) {
            return Err(DeliveryError::ConnectionGone(connection_id.to_string()));
        }
        self.sent
            .lock()
            .await
            .push((connection_id.to_string(), payload.clone()));
        Ok(())
    }
}

/// Email transport that records messages, or fails with a preset error.
#[derive(Default)]
pub struct RecordingEmailTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failure: Mutex<Option<DeliveryError>>,
    attempts: Mutex<usize>,
}

impl RecordingEmailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send with `failure` until cleared with `None`.
    pub async fn set_failure(&self, failure: Option<DeliveryError>) {
        *self.failure.lock().await = failure;
    }

    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().await.clone()
    }

    /// Sends attempted, successful or not.
    pub async fn attempts(&self) -> usize {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl EmailTransport for RecordingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        *self.attempts.lock().await += 1;
        if let Some(failure) = self.failure.lock().await.clone() {
            return Err(failure);
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}
