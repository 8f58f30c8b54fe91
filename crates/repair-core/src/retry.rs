//! Retry with exponential backoff for collaborator calls.
//!
//! Agent calls retry transient failures without limit by default; repair
//! actions always run under a bounded policy.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Backoff schedule and attempt budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` retries until success or a non-retryable error.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

/// The result of a retried call together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Retry without an attempt limit.
    pub fn unlimited(initial_backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff,
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Retry at most `max_attempts` times in total.
    pub fn bounded(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            initial_backoff,
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if self.max_backoff < self.initial_backoff {
            return Err("max_backoff must not be below initial_backoff".to_string());
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is exhausted.
    pub async fn run<F, Fut, T, E, P>(&self, label: &str, mut op: F, is_retryable: P) -> Attempted<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = label, attempt, "retry: succeeded after retries");
                    }
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    let exhausted = self.max_attempts.is_some_and(|max| attempt >= max);
                    if !is_retryable(&e) || exhausted {
                        if exhausted {
                            warn!(op = label, attempts = attempt, error = %e, "retry: attempts exhausted");
                        }
                        return Attempted {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }
                    let delay = self.delay_after(attempt);
                    warn!(
                        op = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retry: transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// [`RetryPolicy::run`] without the attempt count.
    pub async fn retry<F, Fut, T, E, P>(&self, label: &str, op: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run(label, op, is_retryable).await.result
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy::bounded(10, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(3), Duration::from_millis(400));
        assert_eq!(p.delay_after(4), Duration::from_millis(500));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        assert!(RetryPolicy::bounded(0, Duration::from_millis(1)).validate().is_err());
        assert!(RetryPolicy::bounded(1, Duration::from_millis(1)).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_stops() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::bounded(3, Duration::from_millis(10));
        let out: Attempted<(), String> = p
            .run(
                "t",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("down".to_string()) }
                },
                |_| true,
            )
            .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_retry_until_success() {
        let calls = AtomicU32::new(0);
        let p = RetryPolicy::unlimited(Duration::from_millis(10));
        let out = p
            .retry(
                "t",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 7 {
                            Err("flaky".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let p = RetryPolicy::unlimited(Duration::from_secs(60));
        let out: Attempted<(), &str> = p.run("t", || async { Err("fatal") }, |_| false).await;
        assert_eq!(out.attempts, 1);
    }
}
