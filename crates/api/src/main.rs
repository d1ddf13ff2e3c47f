//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{create_pool, migrate};
use herald_common::presence::{PresenceRegistry, RedisPresenceStore};
use herald_common::queue::{MessageQueue, RedisStreamQueue, StreamTopology};
use herald_common::redis_pool::create_redis_pool;
use herald_engine::store::PgNotificationStore;

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    migrate(&pool).await?;
    tracing::info!("Database pool created");

    let redis = create_redis_pool(&config.redis_url).await?;
    let pubsub = redis::Client::open(config.redis_url.as_str())?;
    tracing::info!("Redis connection established");

    let queue = RedisStreamQueue::new(
        redis.clone(),
        StreamTopology {
            stream: config.intake_stream.clone(),
            group: config.intake_group.clone(),
            consumer: config.consumer_name.clone(),
            dead_letter_stream: config.dead_letter_stream.clone(),
            block: Duration::from_secs(1),
            claim_min_idle: Duration::from_millis(config.claim_min_idle_ms),
        },
    );
    queue.declare().await?;

    let state = AppState::new(
        Arc::new(PgNotificationStore::new(pool)),
        Arc::new(queue),
        PresenceRegistry::new(Arc::new(RedisPresenceStore::new(redis))),
        Some(pubsub),
    );

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.api_bind_addr.parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
