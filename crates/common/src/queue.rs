//! Durable message queue on Redis Streams.
//!
//! The intake stream is read through a consumer group, so every entry stays in
//! the group's pending list until it is acknowledged. Requeue and dead-letter
//! are each one atomic pipeline (`XADD` + `XACK`), so a message is never lost
//! between the two streams nor acknowledged without its replacement.
//!
//! On start a consumer replays its own pending entries once, walking a cursor
//! forward so nothing it hands out is replayed twice. Entries left pending by a
//! consumer that died are taken over with `XAUTOCLAIM` once they have been idle
//! for `claim_min_idle`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::AppError;

/// Field holding the message body in every stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

/// A message received from the queue and not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Broker-assigned id, used for acknowledgement.
    pub id: String,
    pub payload: String,
}

/// Consumer side of the intake queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create the stream, consumer group and dead-letter stream if missing.
    async fn declare(&self) -> Result<(), AppError>;

    /// Append a message to the queue and return its id.
    async fn publish(&self, payload: &str) -> Result<String, AppError>;

    /// Receive up to `max` messages; may return fewer (or none) after blocking briefly.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, AppError>;

    /// Positive acknowledgement; the message will not be redelivered.
    async fn ack(&self, message: &QueueMessage) -> Result<(), AppError>;

    /// Negative acknowledgement with requeue. `payload` replaces the original body
    /// so the embedded retry counter survives.
    async fn requeue(&self, message: &QueueMessage, payload: &str) -> Result<(), AppError>;

    /// Negative acknowledgement without requeue: route to the dead-letter stream.
    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), AppError>;

    /// Fails when the broker cannot be reached.
    async fn ping(&self) -> Result<(), AppError>;
}

/// Fire-and-confirm publisher for typed events (used by the outbox relay).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns once the broker has accepted the event.
    async fn publish_event(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AppError>;
}

/// Names of the streams and group backing one queue.
#[derive(Debug, Clone)]
pub struct StreamTopology {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub dead_letter_stream: String,
    /// How long a `receive` blocks waiting for new entries.
    pub block: Duration,
    /// Idle time after which any consumer's unacknowledged entry may be claimed.
    pub claim_min_idle: Duration,
}

/// Where this consumer is in replaying and claiming pending entries.
struct ClaimState {
    /// Last own pending id handed out during startup replay; `None` once done.
    pending_cursor: Option<String>,
    /// `XAUTOCLAIM` scan position; "0-0" starts a new pass.
    autoclaim_cursor: String,
    /// End of the last complete claim pass.
    last_sweep: Option<Instant>,
    /// Ids handed out by `receive` and not yet settled.
    in_flight: HashSet<String>,
}

impl Default for ClaimState {
    fn default() -> Self {
        Self {
            pending_cursor: Some("0".to_string()),
            autoclaim_cursor: "0-0".to_string(),
            last_sweep: None,
            in_flight: HashSet::new(),
        }
    }
}

/// Redis Streams implementation of [`MessageQueue`].
///
/// Use a dedicated `ConnectionManager`: a blocking `XREADGROUP` holds the
/// multiplexed connection for up to `block`.
pub struct RedisStreamQueue {
    redis: ConnectionManager,
    topology: StreamTopology,
    claims: Mutex<ClaimState>,
}

impl RedisStreamQueue {
    pub fn new(redis: ConnectionManager, topology: StreamTopology) -> Self {
        Self {
            redis,
            topology,
            claims: Mutex::new(ClaimState::default()),
        }
    }

    pub fn topology(&self) -> &StreamTopology {
        &self.topology
    }

    fn collect(reply: Option<StreamReadReply>) -> Vec<QueueMessage> {
        let Some(reply) = reply else {
            return Vec::new();
        };
        reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| QueueMessage {
                payload: entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default(),
                id: entry.id,
            })
            .collect()
    }

    /// Next slice of our own pending list, past the replay cursor.
    async fn replay_pending(
        &self,
        claims: &mut ClaimState,
        max: usize,
    ) -> Result<Vec<QueueMessage>, AppError> {
        let Some(cursor) = claims.pending_cursor.clone() else {
            return Ok(Vec::new());
        };
        let mut redis = self.redis.clone();
        let t = &self.topology;
        let opts = StreamReadOptions::default()
            .group(&t.group, &t.consumer)
            .count(max);
        let reply: Option<StreamReadReply> = redis
            .xread_options(&[&t.stream], &[cursor.as_str()], &opts)
            .await?;
        let pending = Self::collect(reply);
        match pending.last() {
            Some(last) => {
                claims.pending_cursor = Some(last.id.clone());
                tracing::info!(count = pending.len(), "Resuming unacknowledged intake messages");
            }
            None => claims.pending_cursor = None,
        }
        Ok(pending)
    }

    /// Take over entries another consumer left idle. At most one full pass
    /// over the pending list per `claim_min_idle`.
    async fn claim_idle(
        &self,
        claims: &mut ClaimState,
        max: usize,
    ) -> Result<Vec<QueueMessage>, AppError> {
        let t = &self.topology;
        if let Some(last) = claims.last_sweep
            && last.elapsed() < t.claim_min_idle
        {
            return Ok(Vec::new());
        }

        let mut redis = self.redis.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&t.stream)
            .arg(&t.group)
            .arg(&t.consumer)
            .arg(t.claim_min_idle.as_millis() as u64)
            .arg(&claims.autoclaim_cursor)
            .arg("COUNT")
            .arg(max)
            .query_async(&mut redis)
            .await?;
        let (next, claimed) = parse_autoclaim(&reply)?;

        if next == "0-0" {
            claims.last_sweep = Some(Instant::now());
        }
        claims.autoclaim_cursor = next;

        let claimed: Vec<QueueMessage> = claimed
            .into_iter()
            .filter(|m| !claims.in_flight.contains(&m.id))
            .collect();
        if !claimed.is_empty() {
            tracing::warn!(
                count = claimed.len(),
                consumer = %t.consumer,
                "Claimed idle intake messages from another consumer"
            );
        }
        Ok(claimed)
    }

    async fn settled(&self, id: &str) {
        self.claims.lock().await.in_flight.remove(id);
    }
}

/// Decode an `XAUTOCLAIM` reply: `[cursor, [[id, [field, value, ..]] | nil, ..]]`,
/// with a trailing list of deleted ids on Redis 7.
fn parse_autoclaim(reply: &redis::Value) -> Result<(String, Vec<QueueMessage>), AppError> {
    let redis::Value::Array(parts) = reply else {
        return Err(AppError::Queue("malformed XAUTOCLAIM reply".to_string()));
    };
    let (Some(cursor), Some(entries)) = (parts.first(), parts.get(1)) else {
        return Err(AppError::Queue("malformed XAUTOCLAIM reply".to_string()));
    };
    let cursor: String = redis::from_redis_value(cursor)?;
    let entries: Vec<redis::Value> = redis::from_redis_value(entries)?;

    let mut messages = Vec::with_capacity(entries.len());
    for entry in &entries {
        // Entries deleted from the stream come back as nil.
        if matches!(entry, redis::Value::Nil) {
            continue;
        }
        let (id, fields): (String, Vec<String>) = redis::from_redis_value(entry)?;
        let payload = fields
            .chunks(2)
            .find(|pair| pair[0] == PAYLOAD_FIELD)
            .and_then(|pair| pair.get(1).cloned())
            .unwrap_or_default();
        messages.push(QueueMessage { id, payload });
    }
    Ok((cursor, messages))
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    async fn declare(&self) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let t = &self.topology;

        let created: Result<(), redis::RedisError> = redis
            .xgroup_create_mkstream(&t.stream, &t.group, "0")
            .await;
        match created {
            Ok(()) => tracing::info!(stream = %t.stream, group = %t.group, "Consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        // The dead-letter stream is created by its first XADD.
        Ok(())
    }

    async fn publish(&self, payload: &str) -> Result<String, AppError> {
        let mut redis = self.redis.clone();
        let id: String = redis
            .xadd(&self.topology.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, AppError> {
        let max = max.max(1);
        {
            let mut claims = self.claims.lock().await;
            let mut batch = self.replay_pending(&mut claims, max).await?;
            if batch.is_empty() {
                batch = self.claim_idle(&mut claims, max).await?;
            }
            if !batch.is_empty() {
                claims.in_flight.extend(batch.iter().map(|m| m.id.clone()));
                return Ok(batch);
            }
        }

        let mut redis = self.redis.clone();
        let t = &self.topology;
        let opts = StreamReadOptions::default()
            .group(&t.group, &t.consumer)
            .count(max)
            .block(t.block.as_millis() as usize);
        let reply: Option<StreamReadReply> =
            redis.xread_options(&[&t.stream], &[">"], &opts).await?;
        let batch = Self::collect(reply);
        if !batch.is_empty() {
            let mut claims = self.claims.lock().await;
            claims.in_flight.extend(batch.iter().map(|m| m.id.clone()));
        }
        Ok(batch)
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let _: i64 = redis
            .xack(&self.topology.stream, &self.topology.group, &[&message.id])
            .await?;
        self.settled(&message.id).await;
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, payload: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let t = &self.topology;
        let _: () = redis::pipe()
            .atomic()
            .xadd(&t.stream, "*", &[(PAYLOAD_FIELD, payload)])
            .ignore()
            .xack(&t.stream, &t.group, &[&message.id])
            .ignore()
            .query_async(&mut redis)
            .await?;
        self.settled(&message.id).await;
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let t = &self.topology;
        let timestamp = Utc::now().timestamp().to_string();
        let _: () = redis::pipe()
            .atomic()
            .xadd(
                &t.dead_letter_stream,
                "*",
                &[
                    (PAYLOAD_FIELD, message.payload.as_str()),
                    ("error", error),
                    ("timestamp", timestamp.as_str()),
                ],
            )
            .ignore()
            .xack(&t.stream, &t.group, &[&message.id])
            .ignore()
            .query_async(&mut redis)
            .await?;
        self.settled(&message.id).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        let _: String = redis::cmd("PING").query_async(&mut redis).await?;
        Ok(())
    }
}

/// Appends typed events to a Redis stream.
#[derive(Clone)]
pub struct RedisStreamPublisher {
    redis: ConnectionManager,
    stream: String,
}

impl RedisStreamPublisher {
    pub fn new(redis: ConnectionManager, stream: impl Into<String>) -> Self {
        Self {
            redis,
            stream: stream.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish_event(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        let mut redis = self.redis.clone();
        let body = serde_json::to_string(payload)?;
        let id: String = redis
            .xadd(
                &self.stream,
                "*",
                &[("event_type", event_type), (PAYLOAD_FIELD, body.as_str())],
            )
            .await?;
        Ok(id)
    }
}

/// A message routed to the dead-letter path of an [`InMemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: String,
    pub error: String,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    acked: Vec<String>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn push(&mut self, payload: &str) -> String {
        self.next_id += 1;
        let id = format!("{}-0", self.next_id);
        self.ready.push_back(QueueMessage {
            id: id.clone(),
            payload: payload.to_string(),
        });
        id
    }

    fn settle(&mut self, id: &str) -> Result<QueueMessage, AppError> {
        self.in_flight
            .remove(id)
            .ok_or_else(|| AppError::Queue(format!("Message {} is not in flight", id)))
    }
}

/// Process-local queue with the same ack/requeue/dead-letter contract.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    arrived: Notify,
    /// While set, every operation fails as if the broker were unreachable.
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Payloads waiting to be received, oldest first.
    pub async fn ready_payloads(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.ready.iter().map(|m| m.payload.clone()).collect()
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Queue("broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn declare(&self) -> Result<(), AppError> {
        self.check_available()
    }

    async fn publish(&self, payload: &str) -> Result<String, AppError> {
        self.check_available()?;
        let id = self.state.lock().await.push(payload);
        self.arrived.notify_one();
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, AppError> {
        self.check_available()?;
        {
            let state = self.state.lock().await;
            if state.ready.is_empty() {
                drop(state);
                let _ = tokio::time::timeout(Duration::from_millis(20), self.arrived.notified()).await;
            }
        }

        let mut state = self.state.lock().await;
        let take = max.max(1).min(state.ready.len());
        let batch: Vec<QueueMessage> = state.ready.drain(..take).collect();
        for message in &batch {
            state.in_flight.insert(message.id.clone(), message.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), AppError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.settle(&message.id)?;
        state.acked.push(message.id.clone());
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, payload: &str) -> Result<(), AppError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.settle(&message.id)?;
        state.push(payload);
        drop(state);
        self.arrived.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, error: &str) -> Result<(), AppError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let message = state.settle(&message.id)?;
        state.dead_letters.push(DeadLetter {
            payload: message.payload,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        self.check_available()
    }
}

/// Records published events in memory.
#[derive(Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<(String, serde_json::Value)>>,
    unavailable: AtomicBool,
}

impl InMemoryPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish_event(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<String, AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Queue("broker unavailable".to_string()));
        }
        let mut published = self.published.lock().await;
        published.push((event_type.to_string(), payload.clone()));
        Ok(format!("{}-0", published.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_marks_messages_in_flight() {
        let queue = InMemoryQueue::new();
        queue.publish("a").await.unwrap();
        queue.publish("b").await.unwrap();
        queue.publish("c").await.unwrap();

        let batch = queue.receive(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, "a");
        assert_eq!(queue.in_flight_count().await, 2);

        queue.ack(&batch[0]).await.unwrap();
        assert_eq!(queue.in_flight_count().await, 1);
        assert!(queue.ack(&batch[0]).await.is_err(), "double ack must fail");
    }

    #[tokio::test]
    async fn test_requeue_replaces_payload_and_dead_letter_keeps_original() {
        let queue = InMemoryQueue::new();
        queue.publish("v1").await.unwrap();

        let first = queue.receive(1).await.unwrap().remove(0);
        queue.requeue(&first, "v2").await.unwrap();
        assert_eq!(queue.ready_payloads().await, vec!["v2".to_string()]);

        let second = queue.receive(1).await.unwrap().remove(0);
        queue.dead_letter(&second, "boom").await.unwrap();
        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, "v2");
        assert_eq!(dead[0].error, "boom");
        assert_eq!(queue.in_flight_count().await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_queue_fails_every_operation() {
        let queue = InMemoryQueue::new();
        queue.set_unavailable(true);
        assert!(queue.publish("x").await.is_err());
        assert!(queue.receive(1).await.is_err());
        queue.set_unavailable(false);
        assert!(queue.receive(1).await.unwrap().is_empty());
    }

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_autoclaim_skips_deleted_entries() {
        let reply = redis::Value::Array(vec![
            bulk("1700000000000-3"),
            redis::Value::Array(vec![
                redis::Value::Array(vec![
                    bulk("1700000000000-1"),
                    redis::Value::Array(vec![bulk(PAYLOAD_FIELD), bulk("{\"a\":1}")]),
                ]),
                redis::Value::Nil,
                redis::Value::Array(vec![
                    bulk("1700000000000-2"),
                    redis::Value::Array(vec![bulk("other"), bulk("x")]),
                ]),
            ]),
            redis::Value::Array(vec![bulk("1699999999999-0")]),
        ]);

        let (cursor, messages) = parse_autoclaim(&reply).unwrap();
        assert_eq!(cursor, "1700000000000-3");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "1700000000000-1");
        assert_eq!(messages[0].payload, "{\"a\":1}");
        assert_eq!(messages[1].payload, "");
    }

    #[test]
    fn test_parse_autoclaim_without_deleted_list() {
        let reply = redis::Value::Array(vec![bulk("0-0"), redis::Value::Array(vec![])]);
        let (cursor, messages) = parse_autoclaim(&reply).unwrap();
        assert_eq!(cursor, "0-0");
        assert!(messages.is_empty());
    }

    #[test]
    fn test_parse_autoclaim_rejects_non_array() {
        assert!(parse_autoclaim(&redis::Value::Nil).is_err());
    }

    #[test]
    fn test_startup_replay_begins_at_own_pending_list() {
        let claims = ClaimState::default();
        assert_eq!(claims.pending_cursor.as_deref(), Some("0"));
        assert_eq!(claims.autoclaim_cursor, "0-0");
        assert!(claims.last_sweep.is_none());
    }
}
