//! Per-provider circuit breaker for fault tolerance.
//!
//! Implements a sliding-window circuit breaker. The circuit has three states:
//!
//! - **Closed**: Normal operation, outcomes are recorded in the window.
//! - **Open**: Provider is failing, requests are rejected without a call.
//! - **HalfOpen**: Cooldown elapsed, exactly one probe request is allowed.
//!
//! ```text
//! Closed   --(window full AND failures/W > threshold)--> Open
//! Open     --(cooldown elapsed)-->                       HalfOpen
//! HalfOpen --(probe success)-->                          Closed (window reset)
//! HalfOpen --(probe failure)-->                          Open   (cooldown restarts)
//! ```
//!
//! A window with fewer than W outcomes never trips the breaker.
//!
//! Every state change starts a new epoch. [`admit`](CircuitBreaker::admit)
//! hands out an [`Admission`] stamped with the current epoch, and outcomes
//! reported through [`record_admitted`](CircuitBreaker::record_admitted) are
//! dropped if the breaker has moved on since. A call let through while
//! Closed can therefore never be mistaken for the HalfOpen probe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::models::ProviderId;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests are allowed.
    Closed,
    /// Provider is failing - requests are blocked.
    Open,
    /// Testing recovery - a single probe is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Persistable view of one breaker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub provider_id: String,
    pub state: CircuitState,
    /// Recorded outcomes, oldest first (`true` = success).
    pub window: Vec<bool>,
    pub last_transition_time: DateTime<Utc>,
}

/// Permission for one call, tied to the breaker epoch it was granted in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Admission {
    epoch: u64,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Last W outcomes, oldest at the front.
    window: VecDeque<bool>,
    last_transition: DateTime<Utc>,
    /// Set once the single HalfOpen probe has been handed out.
    probe_in_flight: bool,
    /// Bumped on every state change.
    epoch: u64,
}

impl Circuit {
    fn failures(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }

    fn transition(&mut self, state: CircuitState, now: DateTime<Utc>) {
        self.state = state;
        self.last_transition = now;
        self.probe_in_flight = false;
        self.epoch += 1;
    }

    fn admission(&self) -> Admission {
        Admission { epoch: self.epoch }
    }
}

/// Circuit breaker for a single provider.
///
/// Thread-safe: every read-modify-write of the window happens under one
/// mutex, so concurrent callers never lose an outcome.
pub struct CircuitBreaker {
    provider: ProviderId,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    /// Create a closed breaker with an empty window.
    pub fn new(provider: ProviderId, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            provider,
            circuit: Mutex::new(Circuit {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                last_transition: now,
                probe_in_flight: false,
                epoch: 0,
            }),
            config,
            clock,
        }
    }

    /// Rebuild a breaker from a persisted snapshot.
    ///
    /// A snapshot taken mid-probe comes back HalfOpen with no probe in
    /// flight, so the next caller gets to probe.
    pub fn restore(
        snapshot: BreakerSnapshot,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let skip = snapshot.window.len().saturating_sub(config.window_size);
        let window: VecDeque<bool> = snapshot.window.into_iter().skip(skip).collect();
        info!(
            "Circuit breaker: restored '{}' in {} state ({} outcomes)",
            snapshot.provider_id,
            snapshot.state,
            window.len()
        );
        Self {
            provider: ProviderId::Owned(snapshot.provider_id),
            circuit: Mutex::new(Circuit {
                state: snapshot.state,
                window,
                last_transition: snapshot.last_transition_time,
                probe_in_flight: false,
                epoch: 0,
            }),
            config,
            clock,
        }
    }

    /// Lock the circuit, recovering from poison if necessary.
    ///
    /// The worst case after a poisoned lock is a slightly stale window,
    /// which is better than panicking every caller of this provider.
    fn lock_circuit(&self) -> MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(|poisoned| {
            warn!(
                "Circuit breaker mutex for '{}' was poisoned, recovering",
                self.provider
            );
            poisoned.into_inner()
        })
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    /// Check whether a call may be attempted.
    ///
    /// Returns false while Open. Once the cooldown has elapsed the breaker
    /// moves to HalfOpen and returns true for exactly one caller; everyone
    /// else is rejected until that probe's outcome is recorded.
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but returns the
    /// admission to report the call's outcome with.
    pub fn admit(&self) -> Option<Admission> {
        let mut circuit = self.lock_circuit();

        match circuit.state {
            CircuitState::Closed => Some(circuit.admission()),
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    None
                } else {
                    circuit.probe_in_flight = true;
                    Some(circuit.admission())
                }
            }
            CircuitState::Open => {
                let now = self.clock.now();
                if now - circuit.last_transition >= self.config.cooldown() {
                    info!(
                        "Circuit breaker: transitioning '{}' from Open to HalfOpen",
                        self.provider
                    );
                    circuit.transition(CircuitState::HalfOpen, now);
                    circuit.probe_in_flight = true;
                    Some(circuit.admission())
                } else {
                    None
                }
            }
        }
    }

    /// Record the outcome of an attempted call.
    pub fn record_outcome(&self, success: bool) {
        let mut circuit = self.lock_circuit();
        self.apply_outcome(&mut circuit, success);
    }

    /// Record the outcome of a call admitted by [`admit`](Self::admit).
    ///
    /// Ignored if the breaker changed state after the admission was granted.
    pub fn record_admitted(&self, admission: Admission, success: bool) {
        let mut circuit = self.lock_circuit();
        if admission != circuit.admission() {
            debug!(
                "Circuit breaker: ignoring stale outcome for '{}' (now {})",
                self.provider, circuit.state
            );
            return;
        }
        self.apply_outcome(&mut circuit, success);
    }

    fn apply_outcome(&self, circuit: &mut Circuit, success: bool) {
        let window_size = self.config.window_size;

        match circuit.state {
            CircuitState::Closed => {
                if circuit.window.len() == window_size {
                    circuit.window.pop_front();
                }
                circuit.window.push_back(success);

                if circuit.window.len() < window_size {
                    return;
                }

                let failures = circuit.failures();
                let error_rate = failures as f64 / window_size as f64;
                if error_rate > self.config.error_threshold {
                    info!(
                        "Circuit breaker: opening circuit for '{}' ({}/{} failures, rate {:.2} > {:.2})",
                        self.provider, failures, window_size, error_rate, self.config.error_threshold
                    );
                    circuit.transition(CircuitState::Open, self.clock.now());
                } else {
                    debug!(
                        "Circuit breaker: '{}' error rate {:.2} within threshold",
                        self.provider, error_rate
                    );
                }
            }
            CircuitState::HalfOpen => {
                let now = self.clock.now();
                if success {
                    info!(
                        "Circuit breaker: closing circuit for '{}' after successful probe",
                        self.provider
                    );
                    circuit.transition(CircuitState::Closed, now);
                    circuit.window.clear();
                } else {
                    info!(
                        "Circuit breaker: reopening circuit for '{}' after failed probe",
                        self.provider
                    );
                    circuit.transition(CircuitState::Open, now);
                }
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late.
                debug!(
                    "Circuit breaker: ignoring late outcome for '{}' (already open)",
                    self.provider
                );
            }
        }
    }

    /// Release an admitted attempt that ended without an outcome (cancelled).
    ///
    /// If it was the HalfOpen probe, the slot goes to the next caller;
    /// otherwise this is a no-op.
    pub fn abandon(&self, admission: Admission) {
        let mut circuit = self.lock_circuit();
        if circuit.state == CircuitState::HalfOpen
            && circuit.probe_in_flight
            && admission == circuit.admission()
        {
            debug!(
                "Circuit breaker: probe for '{}' abandoned, slot released",
                self.provider
            );
            circuit.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock_circuit().state
    }

    /// Failure ratio over the outcomes currently in the window.
    pub fn error_rate(&self) -> f64 {
        let circuit = self.lock_circuit();
        if circuit.window.is_empty() {
            0.0
        } else {
            circuit.failures() as f64 / circuit.window.len() as f64
        }
    }

    /// Number of outcomes currently in the window.
    pub fn window_len(&self) -> usize {
        self.lock_circuit().window.len()
    }

    /// Force the breaker back to Closed with an empty window.
    pub fn reset(&self) {
        let mut circuit = self.lock_circuit();
        info!(
            "Circuit breaker: manually resetting circuit for '{}'",
            self.provider
        );
        circuit.transition(CircuitState::Closed, self.clock.now());
        circuit.window.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let circuit = self.lock_circuit();
        BreakerSnapshot {
            provider_id: self.provider.to_string(),
            state: circuit.state,
            window: circuit.window.iter().copied().collect(),
            last_transition_time: circuit.last_transition,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish()
    }
}
