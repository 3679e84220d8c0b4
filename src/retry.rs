use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_int, v_str, Domain, Level};

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 500,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Calculate delay with exponential backoff and jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn log_retry(operation_name: &str, attempt: u32, total: u32, err: &dyn std::fmt::Display, delay: Duration) {
    log(
        Level::Warn,
        Domain::Store,
        "retry",
        obj(&[
            ("op", v_str(operation_name)),
            ("attempt", v_int(i64::from(attempt + 1))),
            ("max_attempts", v_int(i64::from(total))),
            ("error", v_str(&err.to_string())),
            ("delay_ms", v_int(delay.as_millis() as i64)),
        ]),
    );
}

/// Retry a fallible blocking operation while `retryable` accepts the error.
///
/// Non-retryable errors and the error of the final attempt are returned as-is.
pub fn retry_sync<T, E, F, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let total = config.attempts();
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt + 1 >= total || !retryable(&e) {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                log_retry(operation_name, attempt, total, &e, delay);
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Async counterpart of [`retry_sync`].
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let total = config.attempts();
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt + 1 >= total || !retryable(&e) {
                    return Err(e);
                }
                let delay = config.delay_for_attempt(attempt);
                log_retry(operation_name, attempt, total, &e, delay);
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
