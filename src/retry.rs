//! Retry and timeout utilities.
//!
//! Challenge API retries and the realtime reconnect schedule share one
//! linear backoff: the wait before retry `n` is `step * n`, optionally
//! capped by [`RetryPolicy::max_backoff`].

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded retry budget with linear backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: usize,
    /// Added to the wait for every further retry.
    pub backoff_step: Duration,
    /// Upper bound for a single wait; `None` leaves the schedule uncapped.
    pub max_backoff: Option<Duration>,
}

impl RetryPolicy {
    /// Allows `max_retries` retries after the first attempt.
    pub fn linear(max_retries: usize, step: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            backoff_step: step,
            max_backoff: None,
        }
    }

    /// Policy that never retries.
    pub fn once() -> Self {
        Self::linear(0, Duration::ZERO)
    }

    pub fn with_max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = Some(cap);
        self
    }

    /// Wait applied after the 1-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        let delay = linear_delay(self.backoff_step, attempt);
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Waits that would be applied between attempts, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts.max(1)).map(|attempt| self.delay_for_attempt(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

/// Wait for a 1-based attempt number under linear backoff.
///
/// Attempt zero is treated as the first attempt.
pub fn linear_delay(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt.max(1))
}

/// Runs `op` until it succeeds, `should_retry` rejects its error or the
/// policy's attempt budget is spent. The last error is returned as is.
///
/// `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_scheduled",
            attempt,
            max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Bounds `future` by `timeout`.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}
