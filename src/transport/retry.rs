//! Exponential reconnection backoff.

use crate::config::RetryConfig;
use crate::error::AppResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay schedule between connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Growth factor per failure
    pub factor: f64,
    /// Ceiling for a single delay
    pub max_delay: Duration,
    /// Attempts before giving up; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            factor: config.factor,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failures` consecutive failed attempts (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }

    /// Runs `attempt` until it succeeds, fails with a non-transport error or
    /// the policy is exhausted. The last error is returned in the two latter
    /// cases.
    pub async fn run<T, F, Fut>(&self, what: &str, mut attempt: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut failures = 0u32;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if !err.is_transport() || !self.allows(failures) {
                        return Err(err);
                    }
                    let delay = self.delay_after(failures);
                    warn!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZptessError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_by_factor_up_to_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(4500));
        assert_eq!(policy.delay_after(10), Duration::from_secs(60));
        assert_eq!(policy.delay_after(1000), Duration::from_secs(60));
    }

    #[test]
    fn unbounded_policy_always_allows() {
        assert!(RetryPolicy::default().allows(u32::MAX - 1));
        let once = RetryPolicy {
            max_attempts: Some(1),
            ..RetryPolicy::default()
        };
        assert!(!once.allows(1));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_transport_errors_only() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..RetryPolicy::default()
        };

        let result: AppResult<()> = policy
            .run("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ZptessError::Transport("refused".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        calls.store(0, Ordering::SeqCst);
        let result: AppResult<()> = policy
            .run("connect", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ZptessError::Timeout("info".into()))
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_first_success() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run("connect", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ZptessError::Transport("refused".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
