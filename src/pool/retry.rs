use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{AppError, Result};

/// Exponential backoff with additive jitter for a single call.
///
/// The delay before retry `k` (0-based) is
/// `min(cap_ms, 2^k * base_ms + uniform(0, jitter_ms))`.
/// Keeping `jitter_ms <= base_ms` makes successive delays non-decreasing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    pub jitter_ms: u64,
    /// Budget for each individual attempt; `None` disables the timeout.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_ms: 1_000,
            cap_ms: 30_000,
            jitter_ms: 500,
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_delay(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let scaled = 2u64.saturating_pow(retry).saturating_mul(self.base_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rng.random_range(0..=self.jitter_ms)
        };
        Duration::from_millis(scaled.saturating_add(jitter).min(self.cap_ms))
    }

    fn next_delay(&self, retry: u32) -> Duration {
        self.backoff_delay(retry, &mut rand::rng())
    }

    /// Run `op` until it succeeds, fails with an error `should_retry` rejects,
    /// or `max_retries` retries are spent. The last error is returned.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, F, Fut, P>(&self, label: &str, should_retry: P, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&AppError) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            let result = match self.attempt_timeout {
                Some(budget) => match tokio::time::timeout(budget, op(attempt)).await {
                    Ok(r) => r,
                    Err(_) => Err(AppError::Timeout(budget.as_millis() as u64)),
                },
                None => op(attempt).await,
            };

            match result {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries && should_retry(&e) => {
                    let delay = self.next_delay(attempt);
                    warn!(
                        label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, backing off: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
