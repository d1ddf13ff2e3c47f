//! Redis Streams queue tests. They need a running Redis:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p herald-common --test integration -- --ignored --nocapture
//! ```

use std::collections::HashSet;
use std::time::Duration;

use herald_common::queue::{MessageQueue, RedisStreamQueue, StreamTopology};
use herald_common::redis_pool::create_redis_pool;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn topology(stream: &str, consumer: &str, claim_min_idle: Duration) -> StreamTopology {
    StreamTopology {
        stream: stream.to_string(),
        group: "herald-test".to_string(),
        consumer: consumer.to_string(),
        dead_letter_stream: format!("{}:dlq", stream),
        block: Duration::from_millis(50),
        claim_min_idle,
    }
}

async fn queue(stream: &str, consumer: &str, claim_min_idle: Duration) -> RedisStreamQueue {
    let redis = create_redis_pool(&redis_url()).await.unwrap();
    let queue = RedisStreamQueue::new(redis, topology(stream, consumer, claim_min_idle));
    queue.declare().await.unwrap();
    queue
}

fn unique_stream() -> String {
    format!("herald-test:{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn test_idle_entries_of_dead_consumer_are_claimed_once() {
    let stream = unique_stream();
    let dead = queue(&stream, "consumer-a", Duration::from_secs(3600)).await;
    dead.publish("one").await.unwrap();
    dead.publish("two").await.unwrap();

    // Delivered to A, which never acknowledges.
    let taken = dead.receive(10).await.unwrap();
    assert_eq!(taken.len(), 2);
    drop(dead);

    let survivor = queue(&stream, "consumer-b", Duration::ZERO).await;
    let claimed = survivor.receive(10).await.unwrap();
    let ids: HashSet<String> = claimed.iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, taken.iter().map(|m| m.id.clone()).collect());
    assert_eq!(claimed[0].payload, "one");

    // Claimed entries stay with B until settled and are not handed out again.
    for _ in 0..3 {
        assert!(survivor.receive(10).await.unwrap().is_empty());
    }

    for message in &claimed {
        survivor.ack(message).await.unwrap();
    }
    assert!(survivor.receive(10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_restart_replays_own_pending_entries_once() {
    let stream = unique_stream();
    let first = queue(&stream, "consumer-a", Duration::from_secs(3600)).await;
    for payload in ["a", "b", "c"] {
        first.publish(payload).await.unwrap();
    }
    let unacked = first.receive(10).await.unwrap();
    assert_eq!(unacked.len(), 3);
    drop(first);

    // Same consumer name after a restart.
    let restarted = queue(&stream, "consumer-a", Duration::from_secs(3600)).await;
    let mut replayed = Vec::new();
    replayed.extend(restarted.receive(2).await.unwrap());
    replayed.extend(restarted.receive(2).await.unwrap());
    let payloads: Vec<&str> = replayed.iter().map(|m| m.payload.as_str()).collect();
    assert_eq!(payloads, vec!["a", "b", "c"]);

    // A reconnect re-declares the group without replaying in-flight entries.
    restarted.declare().await.unwrap();
    assert!(restarted.receive(10).await.unwrap().is_empty());

    restarted.publish("d").await.unwrap();
    let fresh = restarted.receive(10).await.unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].payload, "d");
}
