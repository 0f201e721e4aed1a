// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Retry logic with exponential backoff and jitter

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Add up to 25% random delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Default::default()
        }
    }

    /// Run `operation` until it succeeds, fails for good, or attempts run out.
    ///
    /// Only errors for which [`crate::Error::is_retryable`] holds are retried.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = if self.jitter { self.add_jitter(backoff) } else { backoff };
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying after {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    sleep(delay).await;
                    backoff = self.next_backoff(backoff);
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!("Giving up after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max_backoff.as_secs_f64()),
        )
    }

    fn add_jitter(&self, duration: Duration) -> Duration {
        use rand::Rng;
        let jitter_ms = rand::thread_rng().gen_range(0..=duration.as_millis() / 4);
        duration + Duration::from_millis(jitter_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retry_success() {
        let mut attempts = 0;

        let result = fast()
            .execute(|| {
                attempts += 1;
                let attempt = attempts;
                async move {
                    if attempt < 3 {
                        Err(Error::Timeout)
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..fast()
        };

        let result = policy.execute(|| async { Err::<(), _>(Error::Timeout) }).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let mut attempts = 0;
        let result = fast()
            .execute(|| {
                attempts += 1;
                async { Err::<(), _>(Error::Authentication) }
            })
            .await;

        assert!(result.unwrap_err().is_auth_error());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(300),
            ..RetryPolicy::new(5, Duration::from_millis(200))
        };
        assert_eq!(policy.next_backoff(Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
