use std::time::Duration;

use redis::Client;
use redis::aio::ConnectionManager;

use crate::db::{CONNECT_ATTEMPTS, connect_with_retry};

/// Open a Redis connection manager, retrying while the server comes up, and
/// confirm it answers `PING`.
///
/// The manager reconnects transparently after later connection loss; callers
/// only see the failed command.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = connect_with_retry("Redis", CONNECT_ATTEMPTS, Duration::from_secs(1), || {
        ConnectionManager::new(client.clone())
    })
    .await?;
    let _: String = redis::cmd("PING").query_async(&mut manager).await?;

    tracing::info!("Connected to Redis");
    Ok(manager)
}
