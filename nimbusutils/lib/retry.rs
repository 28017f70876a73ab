//! Bounded retry with exponential backoff.
//!
//! Only idempotent reads should go through [`retry_idempotent`]; mutations are surfaced to the
//! caller on their first failure.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Backoff parameters for retrying idempotent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Backoff {
    /// Computes the delay before retry number `attempt` (1-based), with up to 20% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let base = exp.min(self.max_delay);
        let jitter_ms = (base.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };

        base + Duration::from_millis(jitter)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs `op` until it succeeds, `is_retryable` rejects the error, or the attempts run out.
///
/// The last error is returned unchanged so callers keep their own error types.
pub async fn retry_idempotent<T, E, F, Fut>(
    backoff: Backoff,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < backoff.max_attempts && is_retryable(&e) => {
                let delay = backoff.delay_for(attempt);
                tracing::debug!(attempt, error = %e, ?delay, "retrying idempotent operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
