//! Bounded retry with fixed or exponential backoff.
//!
//! Only transient errors (see [`PipelineError::is_transient`]) are retried.
//! Anything else is returned on the first failure. When the attempt ceiling
//! is reached the last error is wrapped in `RetriesExhausted`.

use crate::error::{PipelineError, Result};
use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(retry - 1)`.
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay before the given retry (1-based: the first retry is `1`).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Exponential { base } => base * 2u32.saturating_pow(retry.saturating_sub(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Retries without sleeping. Meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    /// Wait before retrying after `err`. A server-sent `retry-after` wins
    /// over a shorter backoff.
    pub fn delay_for(&self, retry: u32, err: &PipelineError) -> Duration {
        let delay = self.backoff.delay(retry);
        match err {
            PipelineError::RateLimited { retry_after_secs } => {
                delay.max(Duration::from_secs(*retry_after_secs))
            }
            _ => delay,
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T>(&self, label: &str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max => {
                    return Err(PipelineError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt, &e);
                    tracing::warn!(
                        %label,
                        attempt,
                        max_attempts = max,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(30))
    }
}
