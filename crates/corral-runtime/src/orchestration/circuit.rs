//! Per-task-type circuit breaker.
//!
//! Each key (task type) has its own circuit. Failures are kept as a rolling
//! list of timestamps inside the monitor window; once the count reaches the
//! threshold the circuit opens and every dispatch of that key is rejected
//! until the reset timeout elapses. The circuit then goes half-open and
//! admits exactly one trial: success closes it and clears the history,
//! failure re-opens it.

use std::collections::{HashMap, VecDeque};

use corral_core::CircuitBreakerConfig;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned by [`CircuitBreaker::try_acquire`] when a key is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for task type '{task_type}'")]
pub struct CircuitOpen {
    pub task_type: String,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: Instant, config: &CircuitBreakerConfig) {
        let window = config.monitor_window();
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }
}

/// Circuit breaker keyed by task type.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: HashMap<String, Circuit>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: HashMap::new(),
        }
    }

    /// Ask permission to run one task of `key`.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open and
    /// admits the caller as its single trial.
    pub fn try_acquire(&mut self, key: &str, now: Instant) -> Result<(), CircuitOpen> {
        let Some(circuit) = self.circuits.get_mut(key) else {
            return Ok(());
        };
        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map_or(self.config.reset_timeout(), |at| {
                        now.saturating_duration_since(at)
                    });
                if elapsed >= self.config.reset_timeout() {
                    info!(task_type = key, "Circuit half-open, admitting trial");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        task_type: key.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    Err(CircuitOpen {
                        task_type: key.to_string(),
                    })
                } else {
                    circuit.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&mut self, key: &str) {
        if self
            .circuits
            .get(key)
            .is_some_and(|c| c.state == CircuitState::HalfOpen)
        {
            info!(task_type = key, "Circuit trial succeeded, closing");
            self.circuits.remove(key);
        }
    }

    /// Record a failure. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&mut self, key: &str, now: Instant) -> bool {
        let config = &self.config;
        let circuit = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                warn!(task_type = key, "Circuit trial failed, re-opening");
                circuit.failures.push_back(now);
                circuit.prune(now, config);
                circuit.open(now);
                true
            }
            CircuitState::Open => {
                // Late failure from a task admitted before the circuit opened.
                circuit.failures.push_back(now);
                circuit.prune(now, config);
                false
            }
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                circuit.prune(now, config);
                if circuit.failures.len() >= config.failure_threshold {
                    warn!(
                        task_type = key,
                        failures = circuit.failures.len(),
                        "Circuit opened"
                    );
                    circuit.open(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a half-open trial that ended without a verdict (e.g. the
    /// task was cancelled), so the next dispatch can become the trial.
    pub fn release_trial(&mut self, key: &str) {
        if let Some(circuit) = self.circuits.get_mut(key)
            && circuit.state == CircuitState::HalfOpen
        {
            circuit.trial_in_flight = false;
        }
    }

    /// Forget closed circuits whose failures have all left the monitor
    /// window. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let config = &self.config;
        let before = self.circuits.len();
        self.circuits.retain(|_, circuit| {
            if circuit.state != CircuitState::Closed {
                return true;
            }
            circuit.prune(now, config);
            !circuit.failures.is_empty()
        });
        before - self.circuits.len()
    }

    /// Number of task types with a tracked circuit.
    pub fn tracked(&self) -> usize {
        self.circuits.len()
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.circuits
            .get(key)
            .map_or(CircuitState::Closed, |c| c.state)
    }

    /// Failures currently inside the monitor window for `key`.
    pub fn failure_count(&self, key: &str) -> usize {
        self.circuits.get(key).map_or(0, |c| c.failures.len())
    }
}
