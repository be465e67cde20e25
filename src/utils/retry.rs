use anyhow::{Error, Result, anyhow};
use std::{future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::models::common::RetryPolicyConfig;
use crate::utils::strip_html;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            exponential: 2.5,
            jitter: true,
        }
    }
}

impl From<&RetryPolicyConfig> for RetryConfig {
    fn from(policy: &RetryPolicyConfig) -> Self {
        Self {
            // One initial attempt plus the configured retries
            max_attempts: policy.max_retries + 1,
            base_delay_ms: policy.base_delay_ms,
            max_delay_ms: policy.max_delay_ms,
            exponential: policy.multiplier,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based). Grows geometrically and never exceeds `max_delay_ms`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let next_delay = self.base_delay_ms as f64 * self.exponential.powi(exponent);
        let capped = next_delay.min(self.max_delay_ms as f64);

        // Full jitter
        // https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let delay = if self.jitter {
            fastrand::f64() * capped
        } else {
            capped
        };
        Duration::from_millis(delay as u64)
    }
}

pub async fn retry<F, Fut, T>(operation: F, config: &RetryConfig, context: &str) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, Error>>,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        "Operation '{}' failed after {} attempts. Final error: {}",
                        context, attempt, e
                    );
                    return Err(anyhow!(strip_html(&e.to_string()))
                        .context(format!("Failed after {} attempts", attempt)));
                }

                let delay = config.delay_for(attempt);
                warn!(
                    "Attempt {}/{} for '{}' failed: {}. Retrying in {}ms...",
                    attempt,
                    config.max_attempts,
                    context,
                    strip_html(&e.to_string()),
                    delay.as_millis()
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            exponential: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 10_000,
            exponential: 2.5,
            jitter: false,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(config.delay_for(2), Duration::from_millis(5_000));
        assert_eq!(config.delay_for(3), Duration::from_millis(10_000));
        assert_eq!(config.delay_for(8), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jittered_delay_stays_under_cap() {
        let config = RetryConfig::default();
        for retry in 1..10 {
            assert!(config.delay_for(retry) <= Duration::from_millis(config.max_delay_ms));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(42)
                }
            },
            &fast_config(3),
            "flaky",
        )
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("<!doctype html>\n<html>\nService Unavailable\n</html>"))
            },
            &fast_config(2),
            "always_failing",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
