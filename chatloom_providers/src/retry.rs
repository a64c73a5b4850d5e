use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule for opening a connection.
///
/// One delay per entry of `base_delays`, then `final_retries` more attempts
/// spaced by `final_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delays: Vec<Duration>,
    pub final_retries: usize,
    pub final_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delays: vec![Duration::from_millis(250), Duration::from_millis(500)],
            final_retries: 0,
            final_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            base_delays: Vec::new(),
            final_retries: 0,
            final_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn from_millis(delays: &[u64]) -> Self {
        Self {
            base_delays: delays.iter().copied().map(Duration::from_millis).collect(),
            ..Self::none()
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> usize {
        1 + self.base_delays.len() + self.final_retries
    }

    /// Delay before the retry following failed attempt `attempt` (0-based).
    fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.base_delays.get(attempt).copied().or_else(|| {
            (attempt < self.base_delays.len() + self.final_retries).then_some(self.final_delay)
        })
    }
}

/// Retry a async operation with exponential backoff.
///
/// Errors rejected by `is_retryable` are returned immediately.
///
/// # Returns
/// The result of the operation if successful, or the last error if all retries fail
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let Some(delay) = policy.delay_after(attempt).filter(|_| is_retryable(&e)) else {
                    return Err(e);
                };
                attempt += 1;
                warn!(
                    "Request failed (attempt {attempt}/{}): {e}. Retrying after {}ms...",
                    policy.max_attempts(),
                    delay.as_millis()
                );
                sleep(delay).await;
            }
        }
    }
}
