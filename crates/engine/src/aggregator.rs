//! Aggregator: buffers intake events and coalesces them per
//! `(user_id, aggregation_key)` before they reach the store.
//!
//! A flush is triggered when the buffer reaches `batch_size` or when
//! `batch_timeout` has elapsed since the previous flush. Every trigger goes
//! through [`Aggregator::flush`], which runs at most once at a time; a trigger
//! that arrives mid-flush is dropped.
//!
//! A change whose upsert fails is kept, with its `change_id`, and retried at
//! the head of the next flush. Later changes for the same pair queue behind it
//! so a pair's events always apply in arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use herald_common::types::NotificationEvent;

use crate::store::{AggregatedChange, NotificationStore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Failed flush rounds tolerated by `force_flush` before giving up.
    pub shutdown_flush_attempts: u32,
    /// Pause between failed flush rounds during `force_flush`.
    pub shutdown_retry_delay: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            shutdown_flush_attempts: 5,
            shutdown_retry_delay: Duration::from_millis(500),
        }
    }
}

/// Counts from one flush round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Changes written to the store.
    pub applied: usize,
    /// Changes kept for the next round (failed or deferred behind a failure).
    pub retained: usize,
    /// Upserts that failed this round.
    pub failed: usize,
}

#[derive(Default)]
struct FlushState {
    retained: Vec<AggregatedChange>,
}

pub struct Aggregator {
    store: Arc<dyn NotificationStore>,
    config: AggregatorConfig,
    buffer: Mutex<VecDeque<NotificationEvent>>,
    flush_state: Mutex<FlushState>,
    closed: AtomicBool,
    wake: Notify,
}

impl Aggregator {
    pub fn new(store: Arc<dyn NotificationStore>, mut config: AggregatorConfig) -> Self {
        // A zero batch would never drain the buffer.
        config.batch_size = config.batch_size.max(1);
        Self {
            store,
            config,
            buffer: Mutex::new(VecDeque::new()),
            flush_state: Mutex::new(FlushState::default()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Buffer an event. Never touches the store.
    pub async fn accept(&self, event: NotificationEvent) -> Result<(), AggregatorError> {
        let len = {
            let mut buffer = self.buffer.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(AggregatorError::Closed);
            }
            buffer.push_back(event);
            buffer.len()
        };

        if len >= self.config.batch_size {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Stop accepting events. Idempotent.
    pub async fn close(&self) {
        // Taken under the buffer lock so no `accept` lands after the final flush.
        let _buffer = self.buffer.lock().await;
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Events held in retained changes, awaiting a retry.
    pub async fn retained_events(&self) -> usize {
        let state = self.flush_state.lock().await;
        retained_event_count(&state.retained)
    }

    /// Run one flush round unless one is already in progress.
    pub async fn flush(&self) -> Option<FlushReport> {
        let Ok(mut state) = self.flush_state.try_lock() else {
            tracing::debug!("Flush already in progress, skipping trigger");
            return None;
        };
        Some(self.flush_round(&mut state).await)
    }

    /// Flush until buffer and retained changes are empty, waiting for any
    /// in-progress flush first. Returns the number of events left unwritten
    /// after `shutdown_flush_attempts` failed rounds.
    pub async fn force_flush(&self) -> usize {
        let mut state = self.flush_state.lock().await;
        let mut failed_rounds = 0u32;

        loop {
            let report = self.flush_round(&mut state).await;
            let buffered = self.buffer.lock().await.len();
            if buffered == 0 && state.retained.is_empty() {
                return 0;
            }

            if report.failed > 0 {
                failed_rounds += 1;
                if failed_rounds >= self.config.shutdown_flush_attempts {
                    let remaining = buffered + retained_event_count(&state.retained);
                    tracing::error!(
                        remaining,
                        attempts = failed_rounds,
                        "Force flush gave up with unwritten events"
                    );
                    return remaining;
                }
                tokio::time::sleep(self.config.shutdown_retry_delay).await;
            }
        }
    }

    async fn flush_round(&self, state: &mut FlushState) -> FlushReport {
        let drained: Vec<NotificationEvent> = {
            let mut buffer = self.buffer.lock().await;
            let take = buffer.len().min(self.config.batch_size);
            buffer.drain(..take).collect()
        };

        let mut changes = std::mem::take(&mut state.retained);
        changes.extend(consolidate(&drained));
        if changes.is_empty() {
            return FlushReport::default();
        }

        let now = Utc::now();
        let mut report = FlushReport::default();
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        for change in changes {
            let pair = (change.user_id.clone(), change.aggregation_key.clone());
            if blocked.contains(&pair) {
                state.retained.push(change);
                continue;
            }

            match self.store.apply_change(&change, now).await {
                Ok(notification) => {
                    tracing::debug!(
                        notification_id = %notification.id,
                        user_id = %change.user_id,
                        events = change.event_count,
                        count = notification.count,
                        "Change applied"
                    );
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        change_id = %change.change_id,
                        user_id = %change.user_id,
                        aggregation_key = %change.aggregation_key,
                        error = %e,
                        "Upsert failed, retaining change"
                    );
                    report.failed += 1;
                    blocked.insert(pair);
                    state.retained.push(change);
                }
            }
        }

        report.retained = state.retained.len();
        if report.applied > 0 || report.retained > 0 {
            tracing::info!(
                events = drained.len(),
                applied = report.applied,
                retained = report.retained,
                "Flush complete"
            );
        }
        report
    }

    /// Flush on size or time until cancelled, then close intake and drain.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            "Aggregator started"
        );

        let mut last_flush = Instant::now();
        loop {
            let deadline = last_flush + self.config.batch_timeout;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }

            if self.flush().await.is_some() {
                last_flush = Instant::now();
            }
            if self.buffered().await >= self.config.batch_size {
                self.wake.notify_one();
            }
        }

        self.close().await;
        let remaining = self.force_flush().await;
        tracing::info!(remaining, "Aggregator stopped");
    }
}

/// Consolidate events per pair, in order of each pair's first appearance.
fn consolidate(events: &[NotificationEvent]) -> Vec<AggregatedChange> {
    let mut changes: Vec<AggregatedChange> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for event in events {
        let pair = (event.user_id.clone(), event.resolved_aggregation_key());
        match index.get(&pair) {
            Some(&i) => changes[i].absorb(event),
            None => {
                index.insert(pair, changes.len());
                changes.push(AggregatedChange::from_event(event));
            }
        }
    }
    changes
}

fn retained_event_count(changes: &[AggregatedChange]) -> usize {
    changes.iter().map(|c| c.event_count.max(0) as usize).sum()
}
