//! Bounded retry with exponential backoff for transient failures.
//!
//! Retries are only ever applied to transient conditions (bank down/slow,
//! serialization conflicts). Declines are final: retrying a decline is how
//! you double-charge someone.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::LedgerError;

/// Retry schedule: `max_attempts` tries total, delays doubling from
/// `base_delay` up to `max_delay`, with up to 50% random jitter added so
/// concurrent workers do not stampede a recovering bank.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A schedule with no sleeping, for in-process conflicts and tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered.
    fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = rand::rng().random_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is exhausted. The last error is returned as-is.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}
