//! # Circuit Breaker
//!
//! Keyed three-state guard around recovery attempts. Each `category:source`
//! key has its own circuit:
//!
//! - **Closed**: attempts pass; consecutive failures are counted and the
//!   circuit opens once they reach the threshold.
//! - **Open**: attempts are rejected without running until the reset
//!   timeout has elapsed since the last failure.
//! - **Half-open**: a single trial attempt is let through; success closes
//!   the circuit, failure reopens it. A trial abandoned without an outcome
//!   (its task panicked or was cancelled) also reopens it.
//!
//! Circuits are created lazily on first failure and idle closed circuits
//! are swept away; an evicted circuit simply starts over as closed.

use std::sync::Mutex;
use std::time::Duration;

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::expiring::ExpiringMap;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, attempts allowed
    Closed,
    /// Failing, attempts blocked
    Open,
    /// Testing recovery with a single trial
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time after the last failure before a trial is allowed
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Idle time after which a closed circuit is forgotten
const IDLE_CIRCUIT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    /// Set while the single half-open trial is running
    trial_in_flight: bool,
}

impl CircuitStats {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

/// A set of circuits sharing one configuration, keyed by `category:source`
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    circuits: Mutex<ExpiringMap<String, CircuitStats>>,
}

impl CircuitBreaker {
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            circuits: Mutex::new(ExpiringMap::new(IDLE_CIRCUIT_TTL)),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Checks whether an attempt for `key` may run.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and hands out its single trial to this caller.
    pub fn allow_request(&self, key: &str) -> bool {
        self.admit(key).is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but hands back a permit
    /// that reports the attempt's outcome. Dropping the permit of a half-open
    /// trial without reporting reopens the circuit.
    pub fn try_acquire(&self, key: &str) -> Option<AttemptPermit<'_>> {
        self.admit(key).map(|trial| AttemptPermit {
            breaker: self,
            key: key.to_string(),
            trial,
            resolved: false,
        })
    }

    /// `None` rejects the attempt, `Some(true)` admits it as the half-open trial
    fn admit(&self, key: &str) -> Option<bool> {
        if !self.config.enabled {
            return Some(false);
        }

        let reset_timeout = Duration::from_millis(self.config.reset_timeout_ms);
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());

        let stats = match circuits.get_mut(key) {
            Some(stats) => stats,
            None => return Some(false),
        };

        match stats.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let elapsed = stats.last_failure.map_or(reset_timeout, |at| at.elapsed());
                if elapsed >= reset_timeout {
                    stats.state = CircuitState::HalfOpen;
                    stats.trial_in_flight = true;
                    info!(
                        breaker = %self.name,
                        circuit = %key,
                        "Circuit HALF-OPEN: allowing trial attempt"
                    );
                    self.emit_state(key, CircuitState::HalfOpen);
                    Some(true)
                } else {
                    debug!(
                        breaker = %self.name,
                        circuit = %key,
                        remaining_ms = %(reset_timeout - elapsed).as_millis(),
                        "Circuit open, attempt rejected"
                    );
                    None
                }
            }
            CircuitState::HalfOpen => {
                if stats.trial_in_flight {
                    None
                } else {
                    stats.trial_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    /// Reopens a circuit whose half-open trial ended without an outcome
    fn abandon_trial(&self, key: &str) {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stats) = circuits.get_mut(key) {
            if stats.state != CircuitState::HalfOpen || !stats.trial_in_flight {
                return;
            }
            stats.state = CircuitState::Open;
            stats.trial_in_flight = false;
            stats.last_failure = Some(Instant::now());
            warn!(
                breaker = %self.name,
                circuit = %key,
                "Circuit REOPENED: trial attempt abandoned"
            );
            self.emit_state(key, CircuitState::Open);
        }
    }

    /// Records a successful attempt, closing the circuit
    pub fn record_success(&self, key: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stats) = circuits.get_mut(key) {
            let previous = stats.state;
            stats.state = CircuitState::Closed;
            stats.failures = 0;
            stats.trial_in_flight = false;

            if previous != CircuitState::Closed {
                info!(
                    breaker = %self.name,
                    circuit = %key,
                    previous_state = %previous,
                    "Circuit CLOSED: recovery succeeded"
                );
                self.emit_state(key, CircuitState::Closed);
            }
        }
        circuits.touch(key);
    }

    /// Records a failed attempt, opening the circuit when warranted
    pub fn record_failure(&self, key: &str) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        let stats = circuits.get_or_insert_with(key.to_string(), CircuitStats::closed);

        stats.failures = stats.failures.saturating_add(1);
        stats.last_failure = Some(Instant::now());

        match stats.state {
            CircuitState::Closed => {
                if stats.failures >= self.config.failure_threshold {
                    stats.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        circuit = %key,
                        failures = %stats.failures,
                        threshold = %self.config.failure_threshold,
                        "Circuit OPEN: failure threshold reached"
                    );
                    self.emit_state(key, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.trial_in_flight = false;
                warn!(
                    breaker = %self.name,
                    circuit = %key,
                    "Circuit REOPENED: trial attempt failed"
                );
                self.emit_state(key, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Gets the current state of a circuit
    pub fn state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(key).map_or(CircuitState::Closed, |stats| stats.state)
    }

    /// Consecutive failures recorded for a circuit
    pub fn failures(&self, key: &str) -> u32 {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.get(key).map_or(0, |stats| stats.failures)
    }

    /// Forgets idle closed circuits
    pub fn sweep(&self) -> usize {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits.sweep_where(|stats| stats.state == CircuitState::Closed)
    }

    fn emit_state(&self, key: &str, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        };
        gauge!(
            "error_engine.circuit_breaker.state",
            value,
            "breaker" => self.name.clone(),
            "circuit" => key.to_string()
        );
    }
}

/// Admission for one attempt through a [`CircuitBreaker`]
#[must_use = "an unreported trial permit reopens the circuit when dropped"]
pub struct AttemptPermit<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    trial: bool,
    resolved: bool,
}

impl AttemptPermit<'_> {
    /// Whether this attempt is the half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record_success(&self.key);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record_failure(&self.key);
    }
}

impl Drop for AttemptPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.abandon_trial(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "database:users-service";

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                enabled: true,
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3, 1_000);

        assert_eq!(cb.state(KEY), CircuitState::Closed);
        cb.record_failure(KEY);
        cb.record_failure(KEY);
        assert_eq!(cb.state(KEY), CircuitState::Closed);
        assert!(cb.allow_request(KEY));

        cb.record_failure(KEY);
        assert_eq!(cb.state(KEY), CircuitState::Open);
        assert!(!cb.allow_request(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);

        cb.record_failure(KEY);
        cb.record_failure(KEY);
        cb.record_success(KEY);
        cb.record_failure(KEY);
        cb.record_failure(KEY);

        assert_eq!(cb.state(KEY), CircuitState::Closed);
        assert_eq!(cb.failures(KEY), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_single_trial() {
        let cb = breaker(1, 1_000);
        cb.record_failure(KEY);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.allow_request(KEY));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.allow_request(KEY));
        assert_eq!(cb.state(KEY), CircuitState::HalfOpen);
        assert!(!cb.allow_request(KEY));

        cb.record_success(KEY);
        assert_eq!(cb.state(KEY), CircuitState::Closed);
        assert!(cb.allow_request(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(1, 1_000);
        cb.record_failure(KEY);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cb.allow_request(KEY));
        cb.record_failure(KEY);

        assert_eq!(cb.state(KEY), CircuitState::Open);
        // The cool-down restarts from the failed trial
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!cb.allow_request(KEY));
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(cb.allow_request(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_reopens() {
        let cb = breaker(1, 1_000);
        cb.record_failure(KEY);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let permit = cb.try_acquire(KEY).expect("trial should be admitted");
        assert!(permit.is_trial());
        assert!(cb.try_acquire(KEY).is_none());

        tokio::time::advance(Duration::from_millis(300)).await;
        drop(permit);
        assert_eq!(cb.state(KEY), CircuitState::Open);

        // The cool-down restarts from the abandoned trial
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.allow_request(KEY));
        tokio::time::advance(Duration::from_millis(1)).await;

        let permit = cb.try_acquire(KEY).expect("next trial should be admitted");
        permit.succeed();
        assert_eq!(cb.state(KEY), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_permit_drop_is_neutral() {
        let cb = breaker(2, 1_000);
        cb.record_failure(KEY);

        let permit = cb.try_acquire(KEY).expect("closed circuit admits");
        assert!(!permit.is_trial());
        drop(permit);

        assert_eq!(cb.state(KEY), CircuitState::Closed);
        assert_eq!(cb.failures(KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_breaker_never_blocks() {
        let cb = CircuitBreaker::new(
            "off",
            CircuitBreakerConfig { enabled: false, failure_threshold: 1, reset_timeout_ms: 1_000 },
        );

        for _ in 0..5 {
            cb.record_failure(KEY);
        }
        assert!(cb.allow_request(KEY));
        assert_eq!(cb.state(KEY), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_open_circuits() {
        let cb = breaker(1, 1_000);
        cb.record_failure(KEY);
        cb.record_failure("network:programs-service");
        cb.record_success("network:programs-service");

        tokio::time::advance(IDLE_CIRCUIT_TTL + Duration::from_secs(1)).await;

        assert_eq!(cb.sweep(), 1);
        assert_eq!(cb.state(KEY), CircuitState::Open);
    }
}
