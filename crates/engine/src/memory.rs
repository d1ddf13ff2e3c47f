//! Process-local store with the same semantics as the PostgreSQL one.
//!
//! One lock covers notifications and outbox so `complete` stays atomic with
//! its lifecycle record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Notification, NotificationStatus, OutboxRecord};

use crate::outbox::OutboxStore;
use crate::render::{render_message, render_title};
use crate::store::{
    AggregatedChange, AttemptOutcome, NotificationStore, lifecycle_event, page_offset,
};

#[derive(Default)]
struct Tables {
    notifications: HashMap<Uuid, Notification>,
    outbox: Vec<OutboxRecord>,
}

impl Tables {
    fn open_record_mut(&mut self, user_id: &str, aggregation_key: &str) -> Option<&mut Notification> {
        self.notifications.values_mut().find(|n| {
            n.user_id == user_id
                && n.aggregation_key == aggregation_key
                && n.status != NotificationStatus::DeadLetter
        })
    }
}

pub struct InMemoryNotificationStore {
    tables: Mutex<Tables>,
    lifecycle_events: bool,
    unavailable: AtomicBool,
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            lifecycle_events: true,
            unavailable: AtomicBool::new(false),
        }
    }
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lifecycle_events(mut self, enabled: bool) -> Self {
        self.lifecycle_events = enabled;
        self
    }

    /// While set, every operation fails as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every record, including superseded dead letters.
    pub async fn all(&self) -> Vec<Notification> {
        let tables = self.tables.lock().await;
        let mut all: Vec<Notification> = tables.notifications.values().cloned().collect();
        all.sort_by_key(|n| n.created_at);
        all
    }

    /// Every outbox record, processed or not.
    pub async fn outbox(&self) -> Vec<OutboxRecord> {
        self.tables.lock().await.outbox.clone()
    }

    /// Overwrite a record wholesale. Used to age records in tests.
    pub async fn put(&self, notification: Notification) {
        let mut tables = self.tables.lock().await;
        tables.notifications.insert(notification.id, notification);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("store unavailable".to_string()));
        }
        Ok(())
    }
}

fn new_record(change: &AggregatedChange, now: DateTime<Utc>) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        user_id: change.user_id.clone(),
        user_email: change.user_email.clone(),
        title: render_title(&change.title, change.event_count),
        message: render_message(&change.last_message, change.event_count),
        notification_type: change.notification_type.clone(),
        aggregation_key: change.aggregation_key.clone(),
        count: change.event_count,
        last_message_content: change.last_message.clone(),
        is_read: false,
        status: NotificationStatus::Pending,
        retry_count: 0,
        next_retry_at: None,
        created_at: now,
        updated_at: now,
        error_message: None,
        metadata: change.metadata.clone(),
        delivered_via: None,
        lease_token: None,
        last_change_id: Some(change.change_id),
    }
}

fn fold_change(record: &mut Notification, change: &AggregatedChange, now: DateTime<Utc>) {
    record.count += change.event_count;
    record.title = render_title(&change.title, record.count);
    record.message = render_message(&change.last_message, record.count);
    record.last_message_content = change.last_message.clone();
    if !change.user_email.is_empty() {
        record.user_email = change.user_email.clone();
    }
    record.metadata = change.metadata.clone();
    record.is_read = false;
    record.status = NotificationStatus::Pending;
    record.retry_count = 0;
    record.next_retry_at = None;
    record.error_message = None;
    record.delivered_via = None;
    record.lease_token = None;
    record.updated_at = now;
    record.last_change_id = Some(change.change_id);
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn apply_change(
        &self,
        change: &AggregatedChange,
        now: DateTime<Utc>,
    ) -> Result<Notification, AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;

        if let Some(record) = tables.open_record_mut(&change.user_id, &change.aggregation_key) {
            if record.last_change_id != Some(change.change_id) {
                fold_change(record, change, now);
            }
            return Ok(record.clone());
        }

        let record = new_record(change, now);
        tables.notifications.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        self.check_available()?;
        Ok(self.tables.lock().await.notifications.get(&id).cloned())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Notification>, AppError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut records: Vec<&Notification> = tables
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = page_offset(page, page_size) as usize;
        Ok(records
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<i64, AppError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let count = tables
            .notifications
            .values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count();
        Ok(count as i64)
    }

    async fn mark_read(&self, id: Uuid) -> Result<bool, AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        match tables.notifications.get_mut(&id) {
            Some(record) => {
                record.is_read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending(&self, limit: i64) -> Result<Vec<Notification>, AppError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut records: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .cloned()
            .collect();
        records.sort_by_key(|n| n.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn due_for_delivery(
        &self,
        now: DateTime<Utc>,
        stale_lease_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut records: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| match n.status {
                NotificationStatus::Pending => true,
                NotificationStatus::Failed => n.next_retry_at.is_some_and(|at| at <= now),
                NotificationStatus::Processing => n.updated_at <= stale_lease_before,
                NotificationStatus::Sent | NotificationStatus::DeadLetter => false,
            })
            .cloned()
            .collect();
        records.sort_by_key(|n| n.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn claim(
        &self,
        id: Uuid,
        expected_status: NotificationStatus,
        expected_lease: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Option<Notification>, AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.notifications.get_mut(&id) else {
            return Ok(None);
        };
        if record.status != expected_status || record.lease_token != expected_lease {
            return Ok(None);
        }
        record.status = NotificationStatus::Processing;
        record.lease_token = Some(Uuid::new_v4());
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn complete(
        &self,
        id: Uuid,
        lease: Uuid,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let Some(record) = tables.notifications.get_mut(&id) else {
            return Ok(false);
        };
        if record.status != NotificationStatus::Processing || record.lease_token != Some(lease) {
            return Ok(false);
        }

        outcome.apply_to(record, now);
        let lifecycle = lifecycle_event(record);
        if self.lifecycle_events
            && let Some(outbox_record) = lifecycle.into_outbox_record()?
        {
            tables.outbox.push(outbox_record);
        }
        Ok(true)
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}

#[async_trait]
impl OutboxStore for InMemoryNotificationStore {
    async fn record(&self, record: &OutboxRecord) -> Result<(), AppError> {
        self.check_available()?;
        self.tables.lock().await.outbox.push(record.clone());
        Ok(())
    }

    async fn unprocessed(&self, limit: i64) -> Result<Vec<OutboxRecord>, AppError> {
        self.check_available()?;
        let tables = self.tables.lock().await;
        let mut records: Vec<OutboxRecord> = tables
            .outbox
            .iter()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.id == id) {
            record.processed = true;
            record.processed_at = Some(now);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.outbox.iter_mut().find(|r| r.id == id) {
            record.retry_count += 1;
            record.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
