//! Broker consumer: moves notification events from the intake queue into the
//! aggregator.
//!
//! Every message ends in exactly one of ack, requeue or dead-letter. Poison
//! messages (unparseable or invalid) are dead-lettered on first sight; a
//! failed hand-off is requeued with its embedded `retryCount` bumped until
//! `max_delivery_attempts` is reached.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::error::AppError;
use herald_common::queue::{MessageQueue, QueueMessage};
use herald_common::types::NotificationEvent;
use herald_engine::aggregator::Aggregator;

/// Upper bound of the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged messages allowed in flight.
    pub prefetch_count: usize,
    /// Hand-off attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            max_delivery_attempts: 5,
        }
    }
}

/// How a received message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue { retry_count: u32 },
    DeadLetter { reason: String },
}

/// Delay before reconnect attempt `attempt` (1-based): `2^attempt` seconds, capped.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.min(16));
    Duration::from_secs(secs).min(MAX_RECONNECT_DELAY)
}

pub struct BrokerConsumer {
    queue: Arc<dyn MessageQueue>,
    aggregator: Arc<Aggregator>,
    config: ConsumerConfig,
    permits: Arc<Semaphore>,
}

impl BrokerConsumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        aggregator: Arc<Aggregator>,
        config: ConsumerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.prefetch_count.max(1)));
        Self {
            queue,
            aggregator,
            config,
            permits,
        }
    }

    /// Parse, validate and hand off one message, then settle it with the broker.
    pub async fn process(&self, message: &QueueMessage) -> Result<Disposition, AppError> {
        let mut event = match serde_json::from_str::<NotificationEvent>(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                let reason = format!("malformed payload: {}", e);
                tracing::warn!(message_id = %message.id, error = %e, "Dead-lettering malformed message");
                self.queue.dead_letter(message, &reason).await?;
                return Ok(Disposition::DeadLetter { reason });
            }
        };

        if let Err(e) = event.validate() {
            let reason = e.to_string();
            tracing::warn!(message_id = %message.id, error = %e, "Dead-lettering invalid event");
            self.queue.dead_letter(message, &reason).await?;
            return Ok(Disposition::DeadLetter { reason });
        }

        match self.aggregator.accept(event.clone()).await {
            Ok(()) => {
                self.queue.ack(message).await?;
                Ok(Disposition::Ack)
            }
            Err(e) => {
                let attempts = event.retry_count + 1;
                if attempts >= self.config.max_delivery_attempts {
                    let reason = format!("hand-off failed after {} attempts: {}", attempts, e);
                    tracing::error!(
                        message_id = %message.id,
                        user_id = %event.user_id,
                        attempts,
                        "Dead-lettering message after repeated hand-off failures"
                    );
                    self.queue.dead_letter(message, &reason).await?;
                    return Ok(Disposition::DeadLetter { reason });
                }

                event.retry_count = attempts;
                let payload = serde_json::to_string(&event)?;
                tracing::warn!(
                    message_id = %message.id,
                    user_id = %event.user_id,
                    retry_count = attempts,
                    error = %e,
                    "Hand-off failed, requeueing"
                );
                self.queue.requeue(message, &payload).await?;
                Ok(Disposition::Requeue {
                    retry_count: attempts,
                })
            }
        }
    }

    /// Consume until cancelled, then wait for in-flight messages to settle.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            prefetch = self.config.prefetch_count,
            max_delivery_attempts = self.config.max_delivery_attempts,
            "Broker consumer started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut failures = 0u32;

        'connect: while !cancel.is_cancelled() {
            if failures > 0 {
                let delay = reconnect_delay(failures);
                tracing::warn!(attempt = failures, delay_secs = delay.as_secs(), "Reconnecting to broker");
                tokio::select! {
                    _ = cancel.cancelled() => break 'connect,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if let Err(e) = self.queue.declare().await {
                failures += 1;
                tracing::error!(error = %e, "Failed to declare intake topology");
                continue 'connect;
            }

            loop {
                while let Some(result) = tasks.try_join_next() {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Message handler panicked");
                    }
                }

                let first = tokio::select! {
                    _ = cancel.cancelled() => break 'connect,
                    permit = self.permits.clone().acquire_owned() => permit,
                };
                let Ok(first) = first else {
                    break 'connect;
                };
                let mut permits = vec![first];
                while permits.len() < self.config.prefetch_count {
                    match self.permits.clone().try_acquire_owned() {
                        Ok(permit) => permits.push(permit),
                        Err(_) => break,
                    }
                }

                let received = tokio::select! {
                    _ = cancel.cancelled() => break 'connect,
                    received = self.queue.receive(permits.len()) => received,
                };

                let messages = match received {
                    Ok(messages) => messages,
                    Err(e) => {
                        failures += 1;
                        tracing::error!(error = %e, "Intake receive failed");
                        continue 'connect;
                    }
                };
                failures = 0;

                for (message, permit) in messages.into_iter().zip(permits) {
                    let consumer = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = consumer.process(&message).await {
                            // Left unacknowledged; resumed from the pending list.
                            tracing::error!(message_id = %message.id, error = %e, "Failed to settle message");
                        }
                    });
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "Draining in-flight messages");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Message handler panicked");
            }
        }
        tracing::info!("Broker consumer stopped");
    }
}
