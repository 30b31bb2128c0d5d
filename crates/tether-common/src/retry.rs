//! Fixed-delay retry loop
//!
//! The management loops retry on a fixed cadence that the control service
//! relies on (bootstrap every 10 s), so there is no backoff and no jitter.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// How often and how long to retry a failing step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Pause between two attempts
    pub delay: Duration,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl RetryConfig {
    /// Retry forever, waiting `delay` after each failure
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Run `operation` until it succeeds or the attempt budget runs out.
///
/// Every failure is logged with the step name; the last error is returned when
/// `max_attempts` is reached.
pub async fn retry_with_delay<F, Fut, T, E>(
    config: &RetryConfig,
    step: &str,
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
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.exhausted(attempt) {
            error!(step, attempt, error = %e, "Giving up");
            return Err(e);
        }
        warn!(
            step,
            attempt,
            error = %e,
            retry_in_ms = config.delay.as_millis() as u64,
            "Step failed, will retry"
        );
        tokio::time::sleep(config.delay).await;
    }
}
