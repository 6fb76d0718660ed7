//! Retry and timeout policy for remote calls

use crate::config::ClientConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, across hosts (at least 1)
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    /// Timeout for read requests (browse)
    pub read_timeout: Duration,
    /// Timeout for write requests (batch)
    pub write_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): exponential, capped, with up
    /// to 25% jitter subtracted so concurrent writers spread out.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_range = base.as_millis() as u64 / 4;
        if jitter_range == 0 {
            return base;
        }
        let jitter = rand::rng().random_range(0..=jitter_range);
        base - Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            ..Default::default()
        };

        let first = policy.backoff(1);
        assert!(first <= Duration::from_millis(100));
        assert!(first >= Duration::from_millis(75));

        let third = policy.backoff(3);
        assert!(third <= Duration::from_millis(400));
        assert!(third >= Duration::from_millis(300));

        let capped = policy.backoff(30);
        assert!(capped <= Duration::from_millis(1000));
        assert!(capped >= Duration::from_millis(750));
    }

    #[test]
    fn test_from_config_clamps_attempts() {
        let config = ClientConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
