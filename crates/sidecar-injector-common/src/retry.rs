//! Exponential backoff with jitter.
//!
//! [`RetryConfig`] drives both inline retries of a single async operation
//! ([`retry_with_backoff`]) and the per-key requeue delay of the work queue
//! ([`RetryConfig::delay_for`]).

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default backoff, giving up after `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Per-key requeue backoff of the controller work queue: 5ms doubling up
    /// to 1000s, retried forever, no jitter.
    pub fn work_queue() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `failures` counts from 1; the result never exceeds `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64((capped * factor).min(self.max_delay.as_secs_f64()))
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Run `operation` until it succeeds, sleeping [`RetryConfig::delay_for`]
/// between attempts.
///
/// With `max_attempts == 0` this only returns on success; otherwise the error
/// of the final attempt is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        failures = failures.saturating_add(1);

        let exhausted = config.max_attempts != 0 && failures >= config.max_attempts;
        if exhausted {
            error!(operation = operation_name, failures, error = %err, "giving up");
            return Err(err);
        }

        let delay = config.delay_for(failures);
        warn!(
            operation = operation_name,
            failures,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "attempt failed"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn work_queue_delay_doubles() {
        let config = RetryConfig::work_queue();
        assert_eq!(config.delay_for(1), Duration::from_millis(5));
        assert_eq!(config.delay_for(2), Duration::from_millis(10));
        assert_eq!(config.delay_for(4), Duration::from_millis(40));
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig::work_queue();
        assert_eq!(config.delay_for(40), Duration::from_secs(1000));
        assert_eq!(config.delay_for(u32::MAX), Duration::from_secs(1000));
    }

    #[test]
    fn jittered_delay_stays_in_range() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let d = config.delay_for(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, String> =
            retry_with_backoff(&RetryConfig::with_max_attempts(5), "op", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("attempt {n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let result: Result<(), &str> =
            retry_with_backoff(&RetryConfig::with_max_attempts(2), "op", || async {
                Err("boom")
            })
            .await;
        assert_eq!(result, Err("boom"));
    }
}
