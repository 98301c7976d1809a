//! Exponential backoff for startup calls
//!
//! Reconciles are retried by their controller's error policy. Calls made before
//! the controllers run (installing CRDs while the API server is still coming
//! up) go through [`retry_with_backoff`] instead.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule for a retried operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Give up after `attempts` failures
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay after the given failed attempt (1-based), before jitter
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Run `operation` until it succeeds or the attempts are used up
///
/// Each delay is jittered to 0.5x-1.5x of the schedule so replicas restarted
/// together do not hit the API server in lockstep. Returns the last error when
/// `max_attempts` is reached.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "operation failed, giving up"
            );
            return Err(e);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = config.delay_after(attempt).mul_f64(jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn counting_failures(
        failures: u32,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(format!("apiserver unavailable ({n})"))
            } else {
                Ok(n)
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_once_the_apiserver_answers() {
        let (calls, op) = counting_failures(3);

        let result = retry_with_backoff(&RetryConfig::default(), "install_crds", op).await;

        assert_eq!(result, Ok(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_the_last_error_when_attempts_run_out() {
        let (calls, op) = counting_failures(u32::MAX);

        let result = retry_with_backoff(&RetryConfig::with_max_attempts(3), "install_crds", op).await;

        assert_eq!(result, Err("apiserver unavailable (3)".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let (_, op) = counting_failures(2);
        let start = tokio::time::Instant::now();

        retry_with_backoff(&RetryConfig::default(), "install_crds", op)
            .await
            .unwrap();

        // 500ms then 1s, each jittered by at least 0.5x
        assert!(start.elapsed() >= Duration::from_millis(750));
    }

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(1), Duration::from_millis(500));
        assert_eq!(config.delay_after(2), Duration::from_secs(1));
        assert_eq!(config.delay_after(4), Duration::from_secs(4));
        assert_eq!(config.delay_after(20), Duration::from_secs(30));
        assert_eq!(config.delay_after(u32::MAX), Duration::from_secs(30));
    }
}
