//! Transactional outbox and its relay.
//!
//! Records are inserted in the same transaction as the domain write that
//! produced them. The relay publishes them at least once: a record is marked
//! processed only after the broker confirmed the publish, so a crash between
//! the two produces a duplicate, never a loss.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::queue::EventPublisher;
use herald_common::types::OutboxRecord;

/// Durable staging of internally produced events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Stage a record on its own (outside any domain transaction).
    async fn record(&self, record: &OutboxRecord) -> Result<(), AppError>;

    /// Unprocessed records, oldest first.
    async fn unprocessed(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError>;

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;

    /// Count a failed publish; the record stays eligible for the next scan.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError>;
}

/// Insert an outbox record on an existing connection or transaction.
pub(crate) async fn insert_outbox_record(
    conn: &mut PgConnection,
    record: &OutboxRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, event_type, payload, created_at, processed, retry_count)
        VALUES ($1, $2, $3, $4, FALSE, 0)
        "#,
    )
    .bind(record.id)
    .bind(&record.event_type)
    .bind(&record.payload)
    .bind(record.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// PostgreSQL-backed outbox.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn record(&self, record: &OutboxRecord) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_outbox_record(&mut conn, record).await?;
        Ok(())
    }

    async fn unprocessed(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT * FROM outbox
            WHERE processed = FALSE
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE outbox SET processed = TRUE, processed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE outbox SET retry_count = retry_count + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for OutboxRelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 100,
        }
    }
}

/// Counts from one relay scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub published: usize,
    pub failed: usize,
}

/// Publishes staged outbox records to the broker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxRelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxRelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// One scan: publish every unprocessed record in the batch, oldest first.
    pub async fn relay_once(&self, now: DateTime<Utc>) -> Result<RelayReport, AppError> {
        let records = self.store.unprocessed(self.config.batch_size).await?;
        let mut report = RelayReport::default();

        for record in records {
            match self
                .publisher
                .publish_event(&record.event_type, &record.payload)
                .await
            {
                Ok(_) => {
                    self.store.mark_processed(record.id, now).await?;
                    report.published += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %record.id,
                        event_type = %record.event_type,
                        retry_count = record.retry_count + 1,
                        error = %e,
                        "Outbox publish failed"
                    );
                    self.store.mark_failed(record.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Relay until cancelled. The scan in progress completes before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.relay_once(Utc::now()).await {
                Ok(report) if report.published + report.failed > 0 => {
                    tracing::info!(
                        published = report.published,
                        failed = report.failed,
                        "Outbox scan complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Outbox scan failed"),
            }
        }

        tracing::info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryNotificationStore;
    use herald_common::queue::InMemoryPublisher;

    fn relay(store: Arc<InMemoryNotificationStore>, publisher: Arc<InMemoryPublisher>) -> OutboxRelay {
        OutboxRelay::new(store, publisher, OutboxRelayConfig::default())
    }

    #[tokio::test]
    async fn test_relay_publishes_oldest_first_and_marks_processed() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let publisher = InMemoryPublisher::new();
        let t0 = Utc::now();
        let first = OutboxRecord::new("a", serde_json::json!({"n": 1}), t0);
        let second = OutboxRecord::new("b", serde_json::json!({"n": 2}), t0 + chrono::Duration::seconds(1));
        store.record(&second).await.unwrap();
        store.record(&first).await.unwrap();

        let report = relay(store.clone(), publisher.clone()).relay_once(Utc::now()).await.unwrap();

        assert_eq!(report, RelayReport { published: 2, failed: 0 });
        let published = publisher.published().await;
        assert_eq!(published[0].0, "a");
        assert_eq!(published[1].0, "b");
        assert!(store.unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_publish_stays_unprocessed_with_error() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let publisher = InMemoryPublisher::new();
        let record = OutboxRecord::new("a", serde_json::json!({}), Utc::now());
        store.record(&record).await.unwrap();

        publisher.set_unavailable(true);
        let relay = relay(store.clone(), publisher.clone());
        let report = relay.relay_once(Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);

        let pending = store.unprocessed(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("unavailable"));

        publisher.set_unavailable(false);
        let report = relay.relay_once(Utc::now()).await.unwrap();
        assert_eq!(report.published, 1);
        assert!(store.unprocessed(10).await.unwrap().is_empty());
        assert_eq!(publisher.published().await.len(), 1);
    }
}
