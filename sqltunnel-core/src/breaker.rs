//! Per-statement circuit breaker.
//!
//! Each operation fingerprint owns an independent state machine:
//! `Closed` lets calls through and counts consecutive failures; reaching the
//! threshold trips it `Open`, which rejects calls until the cool-down has
//! elapsed; the first call after that runs as a `HalfOpen` trial whose outcome
//! closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::fingerprint::OperationFingerprint;

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: AtomicU32,
    failure_count: AtomicU32,
    trial_in_flight: AtomicBool,
    opened_at: Mutex<Option<Instant>>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(CLOSED),
            failure_count: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            opened_at: Mutex::new(None),
        }
    }

    fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    fn open(&self) {
        *self
            .opened_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
        self.trial_in_flight.store(false, Ordering::SeqCst);
        self.state.store(OPEN, Ordering::SeqCst);
    }

    fn cooled_down(&self, cool_down: Duration) -> bool {
        self.opened_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed() >= cool_down)
            .unwrap_or(true)
    }
}

#[derive(Clone, Serialize)]
pub struct CircuitSnapshot {
    pub fingerprint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Registry of circuits keyed by operation fingerprint.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<OperationFingerprint, Arc<Circuit>>>,
    failure_threshold: u32,
    cool_down: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            cool_down,
        }
    }

    fn circuit(&self, fingerprint: &OperationFingerprint) -> Option<Arc<Circuit>> {
        self.circuits
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(fingerprint)
            .cloned()
    }

    fn circuit_or_insert(&self, fingerprint: &OperationFingerprint) -> Arc<Circuit> {
        if let Some(circuit) = self.circuit(fingerprint) {
            return circuit;
        }
        self.circuits
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Circuit::new()))
            .clone()
    }

    /// Fail fast while the circuit for `fingerprint` is open.
    pub fn pre_check(&self, fingerprint: &OperationFingerprint) -> Result<(), ServerError> {
        let Some(circuit) = self.circuit(fingerprint) else {
            return Ok(());
        };
        let rejected = || ServerError::CircuitOpen {
            fingerprint: fingerprint.to_string(),
        };
        match circuit.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if !circuit.cooled_down(self.cool_down) {
                    return Err(rejected());
                }
                if circuit
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    circuit.trial_in_flight.store(true, Ordering::SeqCst);
                    debug!(%fingerprint, "circuit half-open; allowing trial call");
                    Ok(())
                } else {
                    Err(rejected())
                }
            }
            CircuitState::HalfOpen => {
                if circuit
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Ok(())
                } else {
                    Err(rejected())
                }
            }
        }
    }

    pub fn on_success(&self, fingerprint: &OperationFingerprint) {
        let Some(circuit) = self.circuit(fingerprint) else {
            return;
        };
        circuit.failure_count.store(0, Ordering::SeqCst);
        if circuit.state() != CircuitState::Closed {
            circuit.trial_in_flight.store(false, Ordering::SeqCst);
            circuit.state.store(CLOSED, Ordering::SeqCst);
            debug!(%fingerprint, "circuit closed after successful trial");
        }
    }

    /// The call ended without an engine outcome (pool timeout, bad request);
    /// a pending trial slot is handed back without changing the state.
    pub fn on_abandoned(&self, fingerprint: &OperationFingerprint) {
        if let Some(circuit) = self.circuit(fingerprint) {
            circuit.trial_in_flight.store(false, Ordering::SeqCst);
        }
    }

    pub fn on_failure(&self, fingerprint: &OperationFingerprint, error: &ServerError) {
        let circuit = self.circuit_or_insert(fingerprint);
        let count = circuit.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        match circuit.state() {
            CircuitState::HalfOpen => {
                circuit.open();
                warn!(%fingerprint, %error, "trial call failed; circuit re-opened");
            }
            CircuitState::Closed if count >= self.failure_threshold => {
                circuit.open();
                warn!(
                    %fingerprint,
                    failures = count,
                    cool_down_ms = self.cool_down.as_millis() as u64,
                    %error,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    pub fn state(&self, fingerprint: &OperationFingerprint) -> CircuitState {
        self.circuit(fingerprint)
            .map(|circuit| circuit.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Circuits that are not currently closed.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let circuits = self
            .circuits
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tripped = circuits
            .iter()
            .filter(|(_, circuit)| circuit.state() != CircuitState::Closed)
            .map(|(fingerprint, circuit)| CircuitSnapshot {
                fingerprint: fingerprint.to_string(),
                state: circuit.state(),
                consecutive_failures: circuit.failure_count.load(Ordering::SeqCst),
            })
            .collect::<Vec<_>>();
        tripped.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        tripped
    }
}
