//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::presence::PresenceRegistry;
use herald_common::queue::MessageQueue;
use herald_engine::store::NotificationStore;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    /// Intake queue producers' events are published to.
    pub queue: Arc<dyn MessageQueue>,
    pub presence: PresenceRegistry,
    /// Opens the per-socket pub/sub subscriptions. `None` disables `/ws`.
    pub pubsub: Option<redis::Client>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn MessageQueue>,
        presence: PresenceRegistry,
        pubsub: Option<redis::Client>,
    ) -> Self {
        Self {
            store,
            queue,
            presence,
            pubsub,
        }
    }
}
