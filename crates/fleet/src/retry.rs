//! Bounded retry with exponential backoff.
//!
//! One policy type shared by every place that waits on the outside world:
//! offer fallback, provider status polling, the SSH readiness probe, and
//! workload progress polling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::FleetError;

/// Retry configuration for operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "crate::config::duration_secs")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    #[serde(with = "crate::config::duration_secs")]
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// Give up once this much time has passed since the first attempt.
    #[serde(default, with = "crate::config::option_duration_secs")]
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts starting at `initial_delay`.
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: initial_delay.max(Duration::from_secs(120)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    /// Reject policies that could never make progress or would shrink
    /// their delays. `name` identifies the policy in the error.
    ///
    /// # Errors
    /// Returns [`FleetError::Config`] describing the first bad field.
    pub fn validate(&self, name: &str) -> Result<(), FleetError> {
        if self.max_attempts == 0 {
            return Err(FleetError::Config(format!("{name}: max_attempts must be at least 1")));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(FleetError::Config(format!(
                "{name}: backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }

    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.max(1.0).powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Check if we should retry given the current attempt count.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// An unbounded backoff schedule following this policy's delays.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Stateful delay schedule for polling loops.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay to wait before the next poll.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over from the initial delay (e.g. after observing progress).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. The last error is returned on failure.
///
/// `op` receives the zero-based attempt number.
///
/// # Errors
/// Returns the error of the final attempt.
pub async fn retry<T, E, Op, Fut, R>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: R,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let start = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempts = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;
                if !is_retryable(&e) || !policy.should_retry(attempt) {
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                if let Some(max_elapsed) = policy.max_elapsed {
                    if start.elapsed() + delay > max_elapsed {
                        warn!(operation, attempts = attempt, error = %e, "Retry deadline reached");
                        return Err(e);
                    }
                }

                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
