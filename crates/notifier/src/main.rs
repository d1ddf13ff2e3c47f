use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::presence::{PresenceRegistry, RedisPresenceStore};
use herald_common::{db, redis_pool};
use herald_engine::store::PgNotificationStore;
use herald_notifier::channels::{
    DeliveryRouter, EmailTransport, RedisPushTransport, ResendEmailTransport,
};
use herald_notifier::dispatcher::{Dispatcher, DispatcherConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;
    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;

    let presence = PresenceRegistry::new(Arc::new(RedisPresenceStore::new(redis.clone())));
    let push = Arc::new(RedisPushTransport::new(redis));

    let email: Option<Arc<dyn EmailTransport>> =
        match (config.resend_api_key.clone(), config.email_from.clone()) {
            (Some(api_key), Some(from)) => Some(Arc::new(ResendEmailTransport::new(api_key, from)?)),
            _ => {
                tracing::warn!(
                    "RESEND_API_KEY or EMAIL_FROM not set; offline users cannot be reached"
                );
                None
            }
        };

    let store = Arc::new(
        PgNotificationStore::new(pool).with_lifecycle_events(config.lifecycle_events),
    );
    let router = Arc::new(DeliveryRouter::new(presence, push, email));
    let dispatcher = Dispatcher::new(
        store,
        router,
        DispatcherConfig {
            poll_interval: Duration::from_millis(config.dispatch_poll_interval_ms),
            batch_size: config.dispatch_batch_size,
            max_retries: config.dispatch_max_retries,
            backoff_cap: Duration::from_secs(config.dispatch_backoff_cap_secs),
            lease_timeout: Duration::from_secs(config.dispatch_lease_timeout_secs),
            concurrency: config.dispatch_concurrency,
        },
    );

    let cancel = CancellationToken::new();
    let dispatcher_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();
    dispatcher_task.await?;

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
