//! Retry utilities: capped exponential delays and cancellable sleeps.
//!
//! Every retry or reconnect loop in the adapters sleeps through
//! `sleep_or_cancel`, so `disconnect()` stops them all.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionPolicy;

/// Capped exponential backoff: `min(base * 2^attempt, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Maximum number of retry attempts (0 = no retries, just initial attempt).
    pub max_retries: u32,
}

impl RetryConfig {
    /// Publish retries on the log transport: 100ms doubling, capped at 5s.
    pub fn log_publish(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries,
        }
    }

    /// Publish retries on the queue transport: 1s doubling, capped at 30s.
    pub fn queue_publish(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries,
        }
    }

    /// Handler redelivery: `backoff * 2^retry_count`, capped at one hour.
    pub fn redelivery(backoff: Duration, max_retries: u32) -> Self {
        Self {
            base_delay: backoff,
            max_delay: Duration::from_secs(3600),
            max_retries,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(32));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped_ms)
    }

    /// Check if another retry attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Backoff for producer/admin/connection re-establishment.
///
/// Starts at the policy's retry interval, doubles, caps at 30s, and gives up
/// after `max_retries` attempts.
pub fn reconnect_backoff(policy: &ConnectionPolicy) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(policy.retry_interval())
        .with_max_delay(Duration::from_secs(30).max(policy.retry_interval()))
        .with_max_times(policy.max_retries as usize)
}

/// Fixed-interval backoff for queue-transport connection recovery: waits
/// `retry_interval` between attempts and gives up after `max_retries`.
pub fn reconnect_interval(policy: &ConnectionPolicy) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(policy.retry_interval())
        .with_max_times(policy.max_retries as usize)
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_log_publish_delays() {
        let config = RetryConfig::log_publish(10);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(3200));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(5000));
        assert_eq!(config.delay_for_attempt(20), Duration::from_millis(5000));
    }

    #[test]
    fn test_queue_publish_delays() {
        let config = RetryConfig::queue_publish(3);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_redelivery_delays() {
        let config = RetryConfig::redelivery(Duration::from_millis(100), 2);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert!(config.should_retry(1));
        assert!(!config.should_retry(2));
    }

    #[test]
    fn test_no_overflow_on_large_attempt() {
        let config = RetryConfig::log_publish(100);
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnect_backoff_is_bounded() {
        let policy = ConnectionPolicy {
            max_retries: 3,
            retry_interval_ms: 10,
            timeout_ms: 100,
        };
        let delays: Vec<Duration> = reconnect_backoff(&policy).build().collect();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reconnect_interval_is_fixed() {
        let policy = ConnectionPolicy {
            max_retries: 4,
            retry_interval_ms: 250,
            timeout_ms: 100,
        };
        let delays: Vec<Duration> = reconnect_interval(&policy).build().collect();
        assert_eq!(delays, vec![Duration::from_millis(250); 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(10), &token).await);

        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &token).await);
    }
}
