//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the backoff
//! configurations for requester exchange retries, publish retries,
//! responder re-subscription, and broker connection at startup.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::ExchangeConfig;

/// Backoff between attempts of a whole request/response exchange.
///
/// Bounds and attempt ceiling come from the exchange configuration.
pub fn exchange_backoff(config: &ExchangeConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(config.retry_min_delay())
        .with_max_delay(config.retry_max_delay())
        .with_max_times(config.max_retries as usize)
        .with_jitter()
}

/// Backoff for republishing after a channel or publish failure.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Jitter enabled
pub fn publish_backoff(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Backoff for re-opening a listener after a broker error.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_exchange_backoff_is_bounded_by_config() {
        let config = ExchangeConfig {
            max_retries: 3,
            retry_min_delay_ms: 10,
            retry_max_delay_ms: 40,
            ..Default::default()
        };

        let delays: Vec<Duration> = exchange_backoff(&config).build().collect();
        assert_eq!(delays.len(), 3);
        // Jitter may add up to one more min delay on top of the cap.
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(80)));
    }

    #[test]
    fn test_publish_backoff_attempts() {
        assert_eq!(publish_backoff(2).build().count(), 2);
        assert_eq!(publish_backoff(0).build().count(), 0);
    }

    #[test]
    fn test_reconnect_backoff_keeps_going() {
        assert_eq!(reconnect_backoff().build().take(100).count(), 100);
    }

    #[test]
    fn test_connection_backoff_gives_up() {
        assert_eq!(connection_backoff().build().count(), 30);
    }
}
