use std::time::Duration;

/// Delay before retry `retry_count` (1-based): `min(2^retry_count s, cap)`.
pub fn retry_delay(retry_count: u32, cap: Duration) -> Duration {
    let secs = 2u64.saturating_pow(retry_count.min(32));
    Duration::from_secs(secs).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: Duration = Duration::from_secs(300);

    #[test]
    fn test_delay_doubles() {
        assert_eq!(retry_delay(1, CAP), Duration::from_secs(2));
        assert_eq!(retry_delay(2, CAP), Duration::from_secs(4));
        assert_eq!(retry_delay(8, CAP), Duration::from_secs(256));
    }

    #[test]
    fn test_delay_is_capped() {
        assert_eq!(retry_delay(9, CAP), CAP);
        assert_eq!(retry_delay(1000, CAP), CAP);
    }

    #[test]
    fn test_delay_never_decreases() {
        let delays: Vec<Duration> = (0..20).map(|n| retry_delay(n, CAP)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
