//! Dispatcher: delivery state machine for stored notifications.
//!
//! ```text
//! Pending -> Processing -> Sent
//!                       -> Failed -> Processing -> ... -> DeadLetter
//! ```
//!
//! `Processing` is a lease: a record is claimed with a compare-and-set that
//! installs a fresh lease token, and the outcome is only written if the token
//! still matches. A lease older than `lease_timeout` is reclaimable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::types::{DeliveryRoute, Notification, NotificationStatus};
use herald_engine::store::{AttemptOutcome, NotificationStore};

use crate::backoff::retry_delay;
use crate::channels::{DeliveryError, DeliveryRouter};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Candidates loaded per poll.
    pub batch_size: i64,
    /// Failed attempts before a notification is dead-lettered.
    pub max_retries: u32,
    pub backoff_cap: Duration,
    pub lease_timeout: Duration,
    /// Deliveries in flight at once.
    pub concurrency: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_retries: 3,
            backoff_cap: Duration::from_secs(300),
            lease_timeout: Duration::from_secs(60),
            concurrency: 16,
        }
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Another dispatcher (or a new change) won the claim.
    Skipped,
    Sent(DeliveryRoute),
    Failed { retry_count: i32 },
    DeadLettered { retry_count: i32 },
    /// Delivered or failed, but the lease was lost before the outcome was written.
    LeaseLost,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub candidates: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub lease_lost: usize,
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, attempt: &Attempt) {
        match attempt {
            Attempt::Skipped => self.skipped += 1,
            Attempt::Sent(_) => self.sent += 1,
            Attempt::Failed { .. } => self.failed += 1,
            Attempt::DeadLettered { .. } => self.dead_lettered += 1,
            Attempt::LeaseLost => self.lease_lost += 1,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn NotificationStore>,
    router: Arc<DeliveryRouter>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        router: Arc<DeliveryRouter>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            router,
            config,
        }
    }

    /// Outcome for a failed attempt: retry later, or dead-letter once the
    /// retry budget is spent. Every channel error counts against the budget.
    pub fn failure_outcome(
        &self,
        notification: &Notification,
        error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let retry_count = notification.retry_count + 1;
        if retry_count >= self.config.max_retries as i32 {
            return AttemptOutcome::DeadLetter {
                retry_count,
                error: error.to_string(),
            };
        }

        let delay = retry_delay(retry_count as u32, self.config.backoff_cap);
        let delay = chrono::Duration::seconds(delay.as_secs() as i64);
        AttemptOutcome::Failed {
            retry_count,
            next_retry_at: now + delay,
            error: error.to_string(),
        }
    }

    /// Claim, deliver and settle one candidate.
    pub async fn attempt(
        &self,
        candidate: &Notification,
        now: DateTime<Utc>,
    ) -> Result<Attempt, AppError> {
        let Some(claimed) = self
            .store
            .claim(candidate.id, candidate.status, candidate.lease_token, now)
            .await?
        else {
            tracing::debug!(notification_id = %candidate.id, "Claim lost, skipping");
            return Ok(Attempt::Skipped);
        };
        let lease = claimed.lease_token.ok_or_else(|| {
            AppError::Internal(format!("claimed notification {} has no lease", claimed.id))
        })?;

        if candidate.status == NotificationStatus::Processing {
            tracing::warn!(
                notification_id = %candidate.id,
                "Reclaimed notification with expired lease"
            );
        }

        let outcome = match self.router.deliver(&claimed, now).await {
            Ok(route) => AttemptOutcome::Sent { route },
            Err(e) => self.failure_outcome(&claimed, &e, now),
        };

        if !self.store.complete(claimed.id, lease, &outcome, now).await? {
            tracing::warn!(
                notification_id = %claimed.id,
                "Lease lost before outcome was recorded"
            );
            return Ok(Attempt::LeaseLost);
        }

        let attempt = match outcome {
            AttemptOutcome::Sent { route } => {
                tracing::info!(
                    notification_id = %claimed.id,
                    user_id = %claimed.user_id,
                    route = %route,
                    "Notification sent"
                );
                Attempt::Sent(route)
            }
            AttemptOutcome::Failed {
                retry_count,
                next_retry_at,
                error,
            } => {
                tracing::warn!(
                    notification_id = %claimed.id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "Delivery failed, scheduled retry"
                );
                Attempt::Failed { retry_count }
            }
            AttemptOutcome::DeadLetter { retry_count, error } => {
                tracing::error!(
                    notification_id = %claimed.id,
                    user_id = %claimed.user_id,
                    retry_count,
                    error = %error,
                    "Notification dead-lettered"
                );
                Attempt::DeadLettered { retry_count }
            }
        };
        Ok(attempt)
    }

    /// One poll: deliver every due candidate, `concurrency` at a time.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, AppError> {
        let lease_timeout = chrono::Duration::from_std(self.config.lease_timeout)
            .map_err(|e| AppError::Config(format!("lease timeout out of range: {}", e)))?;
        let candidates = self
            .store
            .due_for_delivery(now, now - lease_timeout, self.config.batch_size)
            .await?;

        let mut report = DispatchReport {
            candidates: candidates.len(),
            ..DispatchReport::default()
        };
        if candidates.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for candidate in candidates {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let dispatcher = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = dispatcher.attempt(&candidate, now).await;
                (candidate.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(attempt))) => report.record(&attempt),
                Ok((id, Err(e))) => {
                    // The claim (if taken) expires and the record is retried.
                    tracing::error!(notification_id = %id, error = %e, "Delivery attempt errored");
                    report.errors += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Delivery task panicked");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Poll until cancelled. The poll in progress completes before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            max_retries = self.config.max_retries,
            "Dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.dispatch_due(Utc::now()).await {
                Ok(report) if report.candidates > 0 => {
                    tracing::info!(
                        candidates = report.candidates,
                        sent = report.sent,
                        failed = report.failed,
                        dead_lettered = report.dead_lettered,
                        skipped = report.skipped,
                        "Dispatch round complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Dispatch round failed"),
            }
        }

        tracing::info!("Dispatcher stopped");
    }
}
