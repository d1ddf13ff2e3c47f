use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (presence, intake queue, push fan-out)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis stream producers publish notification events to
    pub intake_stream: String,

    /// Consumer group reading the intake stream
    pub intake_group: String,

    /// Stable consumer name within the group; pending entries are resumed under it
    pub consumer_name: String,

    /// Idle time after which another consumer's unacknowledged intake entries
    /// are claimed by this one (default: 60000)
    pub claim_min_idle_ms: u64,

    /// Stream receiving poison / exhausted intake messages
    pub dead_letter_stream: String,

    /// Maximum number of unacknowledged intake messages in flight (default: 10)
    pub prefetch_count: usize,

    /// Redeliveries of an intake message before it is dead-lettered (default: 5)
    pub max_delivery_attempts: u32,

    /// Aggregator flush threshold in events (default: 100)
    pub batch_size: usize,

    /// Aggregator flush interval in milliseconds (default: 5000)
    pub batch_timeout_ms: u64,

    /// Dispatcher poll interval in milliseconds (default: 1000)
    pub dispatch_poll_interval_ms: u64,

    /// Notifications claimed per dispatcher poll (default: 50)
    pub dispatch_batch_size: i64,

    /// Concurrent deliveries per dispatcher instance (default: 16)
    pub dispatch_concurrency: usize,

    /// Failed deliveries before a notification is dead-lettered (default: 3)
    pub dispatch_max_retries: u32,

    /// Upper bound of the exponential retry backoff in seconds (default: 300)
    pub dispatch_backoff_cap_secs: u64,

    /// Age after which a `processing` claim is considered abandoned (default: 60)
    pub dispatch_lease_timeout_secs: u64,

    /// Outbox relay poll interval in milliseconds (default: 2000)
    pub outbox_poll_interval_ms: u64,

    /// Outbox records published per relay scan (default: 100)
    pub outbox_batch_size: i64,

    /// Stream the outbox relay publishes lifecycle events to
    pub lifecycle_stream: String,

    /// Record `notification.sent` / `notification.dead_lettered` events in the outbox
    pub lifecycle_events: bool,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Address the HTTP API binds to
    pub api_bind_addr: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_positive("DB_MAX_CONNECTIONS", 20)?,
            intake_stream: std::env::var("INTAKE_STREAM")
                .unwrap_or_else(|_| "notifications:intake".to_string()),
            intake_group: std::env::var("INTAKE_GROUP").unwrap_or_else(|_| "herald".to_string()),
            consumer_name: std::env::var("CONSUMER_NAME").unwrap_or_else(|_| default_consumer_name()),
            claim_min_idle_ms: parse_var("CLAIM_MIN_IDLE_MS", 60_000)?,
            dead_letter_stream: std::env::var("DEAD_LETTER_STREAM")
                .unwrap_or_else(|_| "notifications:intake:dlq".to_string()),
            prefetch_count: parse_positive("PREFETCH_COUNT", 10)?,
            max_delivery_attempts: parse_positive("MAX_DELIVERY_ATTEMPTS", 5)?,
            batch_size: parse_positive("BATCH_SIZE", 100)?,
            batch_timeout_ms: parse_positive("BATCH_TIMEOUT_MS", 5000)?,
            dispatch_poll_interval_ms: parse_positive("DISPATCH_POLL_INTERVAL_MS", 1000)?,
            dispatch_batch_size: parse_positive("DISPATCH_BATCH_SIZE", 50)?,
            dispatch_concurrency: parse_positive("DISPATCH_CONCURRENCY", 16)?,
            dispatch_max_retries: parse_positive("DISPATCH_MAX_RETRIES", 3)?,
            dispatch_backoff_cap_secs: parse_positive("DISPATCH_BACKOFF_CAP_SECS", 300)?,
            dispatch_lease_timeout_secs: parse_positive("DISPATCH_LEASE_TIMEOUT_SECS", 60)?,
            outbox_poll_interval_ms: parse_positive("OUTBOX_POLL_INTERVAL_MS", 2000)?,
            outbox_batch_size: parse_positive("OUTBOX_BATCH_SIZE", 100)?,
            lifecycle_stream: std::env::var("LIFECYCLE_STREAM")
                .unwrap_or_else(|_| "notifications:lifecycle".to_string()),
            lifecycle_events: parse_var("LIFECYCLE_EVENTS", true)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }
}

/// Read an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

/// Like [`parse_var`], but zero and negative values are configuration errors.
fn parse_positive<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + From<u8>,
{
    let value = parse_var(name, default)?;
    if value < T::from(1) {
        anyhow::bail!("{} must be at least 1", name);
    }
    Ok(value)
}

/// The host name survives restarts, so a restarted consumer picks its own
/// pending entries back up under the same name.
fn default_consumer_name() -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => format!("herald-{}", host.trim()),
        _ => "herald-ingest".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default_when_unset() {
        let value: u64 = parse_var("HERALD_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_GARBAGE_VARIABLE", "not-a-number") };
        let result: anyhow::Result<u32> = parse_var("HERALD_TEST_GARBAGE_VARIABLE", 1);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("HERALD_TEST_GARBAGE_VARIABLE"));
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_ZERO_BATCH", "0") };
        let result: anyhow::Result<usize> = parse_positive("HERALD_TEST_ZERO_BATCH", 100);
        let err = result.unwrap_err().to_string();
        assert_eq!(err, "HERALD_TEST_ZERO_BATCH must be at least 1");
    }

    #[test]
    fn test_parse_positive_rejects_negative_signed() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_NEGATIVE_LIMIT", "-5") };
        let result: anyhow::Result<i64> = parse_positive("HERALD_TEST_NEGATIVE_LIMIT", 50);
        assert!(result.unwrap_err().to_string().contains("HERALD_TEST_NEGATIVE_LIMIT"));
    }

    #[test]
    fn test_parse_positive_accepts_one_and_default() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("HERALD_TEST_ONE_INTERVAL", "1") };
        let value: u64 = parse_positive("HERALD_TEST_ONE_INTERVAL", 1000).unwrap();
        assert_eq!(value, 1);
        let value: u64 = parse_positive("HERALD_TEST_UNSET_INTERVAL", 1000).unwrap();
        assert_eq!(value, 1000);
    }

    #[test]
    fn test_default_consumer_name_is_stable() {
        let name = default_consumer_name();
        assert!(name.starts_with("herald-"));
        assert_eq!(name, default_consumer_name());
    }
}
