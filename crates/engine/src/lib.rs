pub mod aggregator;
pub mod memory;
pub mod outbox;
pub mod render;
pub mod store;

pub use aggregator::{Aggregator, AggregatorConfig, AggregatorError};
pub use memory::InMemoryNotificationStore;
pub use outbox::{OutboxRelay, OutboxRelayConfig, OutboxStore, PgOutboxStore};
pub use store::{AggregatedChange, AttemptOutcome, NotificationStore, PgNotificationStore};
