//! # Retry Mechanism
//!
//! Bounded retry loop with exponential backoff and jitter, guarded by a
//! keyed circuit breaker. The loop never propagates an error or a panic:
//! callers only learn whether the operation eventually succeeded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;

/// Upper bound (exclusive) of the random backoff stretch
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// How a retried operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub succeeded: bool,
    /// Number of times the operation actually ran
    pub attempts: u32,
    /// True if an open circuit stopped the loop
    pub short_circuited: bool,
}

/// A retry policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new<S: Into<String>>(name: S, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff after failed attempt `attempt` (1-based) for a given jitter:
    /// `min(base * 2^(attempt-1) * (1 + jitter), max)`
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = (base_ms * 2.0_f64.powi(exponent) * (1.0 + jitter)).min(max_ms);
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Backoff after failed attempt `attempt` with jitter drawn from `[0, factor)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Runs `operation` until it reports success, the attempts are exhausted
    /// or the circuit for `circuit_key` refuses another attempt.
    ///
    /// The operation receives the 1-based attempt number. `Ok(false)`,
    /// `Err(_)` and a panic all count as a failed attempt.
    pub async fn run<F, Fut>(
        &self,
        breaker: Option<&CircuitBreaker>,
        circuit_key: &str,
        mut operation: F,
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let mut attempts = 0;

        for attempt in 1..=self.max_attempts {
            let permit = match breaker {
                Some(cb) => match cb.try_acquire(circuit_key) {
                    Some(permit) => Some(permit),
                    None => {
                        debug!(
                            policy = %self.name,
                            circuit = %circuit_key,
                            attempt = %attempt,
                            "Attempt short-circuited by open circuit"
                        );
                        counter!(format!("retry.{}.short_circuited", self.name), 1);
                        return RetryOutcome { succeeded: false, attempts, short_circuited: true };
                    }
                },
                None => None,
            };

            attempts = attempt;
            counter!(format!("retry.{}.attempts", self.name), 1);

            // A cancelled attempt drops `permit`, which releases a half-open trial
            let result = AssertUnwindSafe(async { operation(attempt).await })
                .catch_unwind()
                .await;

            match result {
                Ok(Ok(true)) => {
                    if let Some(permit) = permit {
                        permit.succeed();
                    }
                    if attempt > 1 {
                        info!(
                            policy = %self.name,
                            circuit = %circuit_key,
                            attempt = %attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    counter!(format!("retry.{}.success", self.name), 1);
                    return RetryOutcome { succeeded: true, attempts, short_circuited: false };
                }
                Ok(Ok(false)) => {
                    debug!(
                        policy = %self.name,
                        circuit = %circuit_key,
                        attempt = %attempt,
                        "Operation reported failure"
                    );
                }
                Ok(Err(e)) => {
                    debug!(
                        policy = %self.name,
                        circuit = %circuit_key,
                        attempt = %attempt,
                        error = %e,
                        "Operation failed"
                    );
                }
                Err(_) => {
                    warn!(
                        policy = %self.name,
                        circuit = %circuit_key,
                        attempt = %attempt,
                        "Operation panicked"
                    );
                }
            }

            if let Some(permit) = permit {
                permit.fail();
            }

            if attempt < self.max_attempts {
                let delay = self.delay_for(attempt);
                debug!(
                    policy = %self.name,
                    attempt = %attempt,
                    delay_ms = %delay.as_millis(),
                    "Retrying after backoff"
                );
                sleep(delay).await;
            }
        }

        warn!(
            policy = %self.name,
            circuit = %circuit_key,
            attempts = %attempts,
            "Operation failed after all attempts"
        );
        counter!(format!("retry.{}.failure", self.name), 1);

        RetryOutcome { succeeded: false, attempts, short_circuited: false }
    }
}
