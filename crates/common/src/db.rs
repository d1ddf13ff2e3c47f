use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Connection attempts made at startup before giving up.
pub const CONNECT_ATTEMPTS: u32 = 5;

/// Run `connect` until it succeeds or `attempts` are spent, sleeping
/// `delay * attempt` in between. Services start alongside their database and
/// broker, which may not accept connections yet.
pub async fn connect_with_retry<T, E, F, Fut>(
    what: &str,
    attempts: u32,
    delay: Duration,
    mut connect: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::warn!(service = what, attempt, error = %e, "Not reachable yet, retrying");
                tokio::time::sleep(delay * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("{} unreachable after {} attempts", what, attempts));
            }
        }
    }
}

/// Create a PostgreSQL pool and confirm it answers a query.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let options = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5));

    let pool = connect_with_retry("PostgreSQL", CONNECT_ATTEMPTS, Duration::from_secs(1), || {
        options.clone().connect(database_url)
    })
    .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply the workspace migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying notification migrations")?;
    tracing::info!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let calls = AtomicU32::new(0);
        let value = connect_with_retry("db", 5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(std::io::Error::other("refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = connect_with_retry("broker", 2, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(std::io::Error::other("refused")) }
        })
        .await;

        let err = result.unwrap_err().to_string();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.contains("broker unreachable after 2 attempts"));
    }
}
