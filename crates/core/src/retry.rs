use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before attempt `attempt + 1`: base, 2x base, 4x base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Runs `op` until it succeeds or `backoff.max_attempts` is reached, sleeping with exponential
/// backoff in between. Returns the last error after exhaustion.
pub async fn retry_with_backoff<T, E, F, Fut>(label: &str, backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::warn!(label, attempt, error = %err, "giving up after final attempt");
                    return Err(err);
                }
                let delay = backoff.delay_after(attempt);
                tracing::warn!(label, attempt, ?delay, error = %err, "attempt failed; retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
