use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::queue::{RedisStreamPublisher, RedisStreamQueue, StreamTopology};
use herald_common::{db, redis_pool};
use herald_engine::aggregator::{Aggregator, AggregatorConfig};
use herald_engine::outbox::{OutboxRelay, OutboxRelayConfig, PgOutboxStore};
use herald_engine::store::PgNotificationStore;
use herald_ingest::consumer::{BrokerConsumer, ConsumerConfig};

/// How long one intake read blocks before re-checking for shutdown.
const RECEIVE_BLOCK: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_ingest=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald ingest starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    // Blocking XREADGROUP calls get a connection of their own.
    let queue_redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let publisher_redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(
        PgNotificationStore::new(pool.clone()).with_lifecycle_events(config.lifecycle_events),
    );
    let aggregator = Arc::new(Aggregator::new(
        store,
        AggregatorConfig {
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
            ..AggregatorConfig::default()
        },
    ));

    let queue = Arc::new(RedisStreamQueue::new(
        queue_redis,
        StreamTopology {
            stream: config.intake_stream.clone(),
            group: config.intake_group.clone(),
            consumer: config.consumer_name.clone(),
            dead_letter_stream: config.dead_letter_stream.clone(),
            block: RECEIVE_BLOCK,
            claim_min_idle: Duration::from_millis(config.claim_min_idle_ms),
        },
    ));
    let consumer = Arc::new(BrokerConsumer::new(
        queue,
        aggregator.clone(),
        ConsumerConfig {
            prefetch_count: config.prefetch_count,
            max_delivery_attempts: config.max_delivery_attempts,
        },
    ));

    let relay = OutboxRelay::new(
        Arc::new(PgOutboxStore::new(pool)),
        Arc::new(RedisStreamPublisher::new(
            publisher_redis,
            config.lifecycle_stream.clone(),
        )),
        OutboxRelayConfig {
            poll_interval: Duration::from_millis(config.outbox_poll_interval_ms),
            batch_size: config.outbox_batch_size,
        },
    );

    tracing::info!(
        stream = %config.intake_stream,
        group = %config.intake_group,
        consumer = %config.consumer_name,
        "Consuming intake stream"
    );

    let cancel = CancellationToken::new();
    // Closed only after the consumer has drained, so in-flight hand-offs land
    // before the final flush.
    let flush_cancel = CancellationToken::new();
    let consumer_task = tokio::spawn(consumer.run(cancel.clone()));
    let aggregator_task = {
        let aggregator = aggregator.clone();
        let flush_cancel = flush_cancel.clone();
        tokio::spawn(async move { aggregator.run(flush_cancel).await })
    };
    let relay_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { relay.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();

    consumer_task.await?;
    flush_cancel.cancel();
    aggregator_task.await?;
    relay_task.await?;

    tracing::info!("Herald ingest stopped.");
    Ok(())
}
