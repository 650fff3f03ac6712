//! Bounded exponential backoff for cloud calls

use std::thread;
use std::time::Duration;

use tracing::warn;

use super::{CloudError, CloudOp, CloudResult};

/// Retry policy applied to throttled and transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// A policy that retries immediately (tests)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Run `f`, retrying retryable failures
    pub fn run<T>(&self, op: CloudOp, f: impl FnMut() -> CloudResult<T>) -> CloudResult<T> {
        self.run_when(op, CloudError::is_retryable, f)
    }

    /// Run `f`, retrying only failures accepted by `should_retry`
    pub fn run_when<T>(
        &self,
        op: CloudOp,
        should_retry: impl Fn(&CloudError) -> bool,
        mut f: impl FnMut() -> CloudResult<T>,
    ) -> CloudResult<T> {
        let mut retries = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if should_retry(&err) && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.backoff(retries);
                    warn!(
                        op = op.name(),
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying cloud call"
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
