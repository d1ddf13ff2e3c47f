//! Notification store access layer.
//!
//! Every lifecycle transition is a compare-and-set on `status` (and on the
//! lease token while `processing`), so concurrent dispatchers and a concurrent
//! aggregator flush can never overwrite each other's writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    DeliveryRoute, Notification, NotificationEvent, NotificationLifecycleEvent, NotificationStatus,
};

use crate::outbox::insert_outbox_record;
use crate::render::{render_message, render_title};

/// The consolidated effect of every buffered event for one
/// `(user_id, aggregation_key)` pair within one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedChange {
    /// Stable across retries; the store skips a change it has already applied.
    pub change_id: Uuid,
    pub user_id: String,
    pub user_email: String,
    pub aggregation_key: String,
    pub notification_type: String,
    /// Title of the latest event.
    pub title: String,
    pub event_count: i32,
    /// Message of the last event.
    pub last_message: String,
    /// Metadata of the last event.
    pub metadata: serde_json::Value,
}

impl AggregatedChange {
    pub fn from_event(event: &NotificationEvent) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            user_id: event.user_id.clone(),
            user_email: event.user_email.clone(),
            aggregation_key: event.resolved_aggregation_key(),
            notification_type: event.notification_type.clone(),
            title: event.title.clone(),
            event_count: 1,
            last_message: event.message.clone(),
            metadata: event.metadata.clone(),
        }
    }

    /// Fold a later event for the same pair into this change.
    pub fn absorb(&mut self, event: &NotificationEvent) {
        self.event_count += 1;
        self.title = event.title.clone();
        self.last_message = event.message.clone();
        self.metadata = event.metadata.clone();
        if !event.user_email.is_empty() {
            self.user_email = event.user_email.clone();
        }
    }

    pub fn pair(&self) -> (&str, &str) {
        (&self.user_id, &self.aggregation_key)
    }
}

/// Result of one delivery attempt, applied by [`NotificationStore::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Sent {
        route: DeliveryRoute,
    },
    Failed {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: String,
    },
    DeadLetter {
        retry_count: i32,
        error: String,
    },
}

impl AttemptOutcome {
    pub fn status(&self) -> NotificationStatus {
        match self {
            AttemptOutcome::Sent { .. } => NotificationStatus::Sent,
            AttemptOutcome::Failed { .. } => NotificationStatus::Failed,
            AttemptOutcome::DeadLetter { .. } => NotificationStatus::DeadLetter,
        }
    }

    fn retry_count(&self) -> Option<i32> {
        match self {
            AttemptOutcome::Sent { .. } => None,
            AttemptOutcome::Failed { retry_count, .. }
            | AttemptOutcome::DeadLetter { retry_count, .. } => Some(*retry_count),
        }
    }

    fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AttemptOutcome::Failed { next_retry_at, .. } => Some(*next_retry_at),
            _ => None,
        }
    }

    fn error(&self) -> Option<&str> {
        match self {
            AttemptOutcome::Sent { .. } => None,
            AttemptOutcome::Failed { error, .. } | AttemptOutcome::DeadLetter { error, .. } => {
                Some(error)
            }
        }
    }

    fn route(&self) -> Option<DeliveryRoute> {
        match self {
            AttemptOutcome::Sent { route } => Some(*route),
            _ => None,
        }
    }

    /// Apply the outcome to an in-memory record.
    pub(crate) fn apply_to(&self, notification: &mut Notification, now: DateTime<Utc>) {
        notification.status = self.status();
        if let Some(retry_count) = self.retry_count() {
            notification.retry_count = retry_count;
        }
        notification.next_retry_at = self.next_retry_at();
        notification.error_message = self.error().map(str::to_string);
        notification.delivered_via = self.route();
        notification.lease_token = None;
        notification.updated_at = now;
    }
}

/// Lifecycle event for a record that just reached a terminal status.
pub(crate) fn lifecycle_event(notification: &Notification) -> NotificationLifecycleEvent {
    NotificationLifecycleEvent {
        notification_id: notification.id,
        user_id: notification.user_id.clone(),
        aggregation_key: notification.aggregation_key.clone(),
        status: notification.status,
        delivered_via: notification.delivered_via,
        retry_count: notification.retry_count,
        error_message: notification.error_message.clone(),
        occurred_at: notification.updated_at,
    }
}

/// Persistence of notification records.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Create the open record for the change's pair, or fold the change into it.
    ///
    /// Replaying a change whose `change_id` was already applied returns the
    /// current record unchanged.
    async fn apply_change(
        &self,
        change: &AggregatedChange,
        now: DateTime<Utc>,
    ) -> Result<Notification, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// Newest first. `page` starts at 1.
    async fn list_for_user(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Notification>, AppError>;

    async fn unread_count(&self, user_id: &str) -> Result<i64, AppError>;

    /// Returns `false` when no record has this id.
    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError>;

    /// Records awaiting their first delivery attempt, oldest first.
    async fn pending(&self, limit: i64) -> Result<Vec<Notification>, AppError>;

    /// Candidates for delivery: pending, failed and due, or processing with a
    /// lease older than `stale_lease_before`. Oldest first.
    async fn due_for_delivery(
        &self,
        now: DateTime<Utc>,
        stale_lease_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// Move a record to `processing` under a fresh lease, provided it is still
    /// in `expected_status` with `expected_lease`. `None` means another
    /// writer got there first.
    async fn claim(
        &self,
        id: Uuid,
        expected_status: NotificationStatus,
        expected_lease: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError>;

    /// Record the outcome of the attempt holding `lease`. Returns `false` when
    /// the lease was lost (reclaimed, or superseded by a new change).
    async fn complete(
        &self,
        id: Uuid,
        lease: Uuid,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Fails when the backing database cannot be reached.
    async fn ping(&self) -> Result<(), AppError>;
}

pub(crate) fn page_offset(page: u32, page_size: u32) -> i64 {
    i64::from(page.max(1) - 1) * i64::from(page_size)
}

/// PostgreSQL-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
    lifecycle_events: bool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lifecycle_events: true,
        }
    }

    /// Toggle writing `notification.sent` / `notification.dead_lettered` outbox records.
    pub fn with_lifecycle_events(mut self, enabled: bool) -> Self {
        self.lifecycle_events = enabled;
        self
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn apply_change(
        &self,
        change: &AggregatedChange,
        now: DateTime<Utc>,
    ) -> Result<Notification, AppError> {
        let applied = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (
                id, user_id, user_email, title, message, notification_type,
                aggregation_key, count, last_message_content, is_read, status,
                retry_count, created_at, updated_at, metadata, last_change_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, 0, $11, $11, $12, $13)
            ON CONFLICT (user_id, aggregation_key) WHERE status <> 'dead_letter'
            DO UPDATE SET
                count = notifications.count + EXCLUDED.count,
                title = $14 || ' (' || (notifications.count + EXCLUDED.count)::text || ' messages)',
                message = 'Latest: ' || EXCLUDED.last_message_content,
                last_message_content = EXCLUDED.last_message_content,
                user_email = CASE
                    WHEN EXCLUDED.user_email <> '' THEN EXCLUDED.user_email
                    ELSE notifications.user_email
                END,
                metadata = EXCLUDED.metadata,
                is_read = FALSE,
                status = EXCLUDED.status,
                retry_count = 0,
                next_retry_at = NULL,
                error_message = NULL,
                delivered_via = NULL,
                lease_token = NULL,
                updated_at = EXCLUDED.updated_at,
                last_change_id = EXCLUDED.last_change_id
            WHERE notifications.last_change_id IS DISTINCT FROM EXCLUDED.last_change_id
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&change.user_id)
        .bind(&change.user_email)
        .bind(render_title(&change.title, change.event_count))
        .bind(render_message(&change.last_message, change.event_count))
        .bind(&change.notification_type)
        .bind(&change.aggregation_key)
        .bind(change.event_count)
        .bind(&change.last_message)
        .bind(NotificationStatus::Pending.to_string())
        .bind(now)
        .bind(&change.metadata)
        .bind(change.change_id)
        .bind(&change.title)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(notification) = applied {
            tracing::debug!(
                notification_id = %notification.id,
                user_id = %notification.user_id,
                count = notification.count,
                "Aggregated change applied"
            );
            return Ok(notification);
        }

        // The conflict target matched but the change was already applied.
        tracing::debug!(change_id = %change.change_id, "Change already applied, skipping");
        let existing = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1 AND aggregation_key = $2 AND status <> 'dead_letter'
            "#,
        )
        .bind(&change.user_id)
        .bind(&change.aggregation_key)
        .fetch_optional(&self.pool)
        .await?;

        existing.ok_or_else(|| {
            AppError::Internal(format!(
                "open notification for change {} disappeared",
                change.change_id
            ))
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let notification =
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(notification)
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(i64::from(page_size))
        .bind(page_offset(page, page_size))
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE user_id = $1 AND is_read = FALSE",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pending(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(NotificationStatus::Pending.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn due_for_delivery(
        &self,
        now: DateTime<Utc>,
        stale_lease_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE status = 'pending'
               OR (status = 'failed' AND next_retry_at <= $1)
               OR (status = 'processing' AND updated_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(stale_lease_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_status: NotificationStatus,
        expected_lease: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        let claimed = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET status = 'processing', lease_token = $4, updated_at = $5
            WHERE id = $1
              AND status = $2
              AND lease_token IS NOT DISTINCT FROM $3
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_status.to_string())
        .bind(expected_lease)
        .bind(Uuid::new_v4())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed)
    }

    async fn complete(
        &self,
        id: Uuid,
        lease: Uuid,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET status = $3,
                retry_count = COALESCE($4, retry_count),
                next_retry_at = $5,
                error_message = $6,
                delivered_via = $7,
                lease_token = NULL,
                updated_at = $8
            WHERE id = $1 AND status = 'processing' AND lease_token = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(lease)
        .bind(outcome.status().to_string())
        .bind(outcome.retry_count())
        .bind(outcome.next_retry_at())
        .bind(outcome.error())
        .bind(outcome.route().map(|r| r.to_string()))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(notification) = updated else {
            tx.rollback().await?;
            return Ok(false);
        };

        if self.lifecycle_events
            && let Some(record) = lifecycle_event(&notification).into_outbox_record()?
        {
            insert_outbox_record(&mut *tx, &record).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
