//! Keyed circuit registry and the per-key state machine.

use crate::window::OutcomeWindow;
use derive_getters::Getters;
use gatekeeper_core::{CircuitPolicy, CircuitState, GatekeeperConfig};
use gatekeeper_error::{CallError, CallResult};
use gatekeeper_metrics::GatekeeperMetrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Circuit {
    key: String,
    policy: CircuitPolicy,
    state: CircuitState,
    window: OutcomeWindow,
    opened_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
    // Bumped on every transition so permits from an earlier period are ignored.
    generation: u64,
    notify: watch::Sender<CircuitState>,
}

impl Circuit {
    fn new(key: &str, policy: CircuitPolicy) -> Self {
        let (notify, _) = watch::channel(CircuitState::Closed);
        Self {
            key: key.to_string(),
            cooldown: policy.cooldown(),
            policy,
            state: CircuitState::Closed,
            window: OutcomeWindow::default(),
            opened_at: None,
            next_probe_at: None,
            probe_in_flight: false,
            generation: 0,
            notify,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.notify.send_replace(to);
        GatekeeperMetrics::get().record_transition(&self.key, from, to);
    }

    fn open(&mut self, now: Instant) {
        self.opened_at = Some(now);
        self.next_probe_at = Some(now + self.cooldown);
        self.probe_in_flight = false;
        self.transition(CircuitState::Open);
    }

    fn retry_in(&self, now: Instant) -> Duration {
        self.next_probe_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn rejection(&self, now: Instant) -> CallError {
        CallError::circuit_open(self.key.clone(), self.retry_in(now))
    }

    fn admit(&mut self, now: Instant) -> Result<bool, CallError> {
        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                if self.next_probe_at.is_some_and(|at| now >= at) {
                    self.probe_in_flight = true;
                    self.transition(CircuitState::HalfOpen);
                    info!(key = %self.key, "Circuit half-open, admitting probe");
                    Ok(true)
                } else {
                    Err(self.rejection(now))
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(self.rejection(now))
                } else {
                    self.probe_in_flight = true;
                    debug!(key = %self.key, "Re-admitting probe after abandoned trial");
                    Ok(true)
                }
            }
        }
    }

    fn settle(&mut self, generation: u64, probe: bool, failed: bool, now: Instant) {
        if generation != self.generation {
            debug!(key = %self.key, "Ignoring outcome from an earlier circuit period");
            return;
        }

        match (self.state, probe) {
            (CircuitState::Closed, false) => {
                self.window.push(now, failed, &self.policy);
                if failed && self.window.should_open(&self.policy) {
                    warn!(
                        key = %self.key,
                        failures = self.window.failures(),
                        calls = self.window.calls(),
                        cooldown_ms = self.cooldown.as_millis() as u64,
                        "Circuit opened"
                    );
                    self.open(now);
                }
            }
            (CircuitState::HalfOpen, true) if failed => {
                let max = self.policy.max_cooldown();
                let grown = self.cooldown.as_secs_f64() * *self.policy.cooldown_multiplier();
                self.cooldown = Duration::try_from_secs_f64(grown).unwrap_or(max).min(max);
                warn!(
                    key = %self.key,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Probe failed, circuit re-opened"
                );
                self.open(now);
            }
            (CircuitState::HalfOpen, true) => {
                self.window.clear();
                self.cooldown = self.policy.cooldown();
                self.opened_at = None;
                self.next_probe_at = None;
                self.probe_in_flight = false;
                self.transition(CircuitState::Closed);
                info!(key = %self.key, "Probe succeeded, circuit closed");
            }
            _ => {}
        }
    }

    fn abandon_probe(&mut self, generation: u64) {
        if generation == self.generation && self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn snapshot(&mut self, now: Instant) -> CircuitSnapshot {
        self.window
            .trim(now, self.policy.window(), *self.policy.window_size());
        CircuitSnapshot {
            key: self.key.clone(),
            state: self.state,
            cooldown: self.cooldown,
            failures: self.window.failures(),
            calls: self.window.calls(),
            retry_in: (self.state == CircuitState::Open).then(|| self.retry_in(now)),
        }
    }
}

type SharedCircuit = Arc<Mutex<Circuit>>;

/// Circuit breaker holding one circuit per key.
///
/// Circuits are created closed on first use, configured from the policy of
/// the method that first touches the key.
///
/// # Example
///
/// ```rust,no_run
/// use gatekeeper_circuit::CircuitBreaker;
/// use gatekeeper_core::GatekeeperConfig;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::new(Arc::new(GatekeeperConfig::load()?));
/// let permit = breaker.check("friends.get", "friends.get")?;
/// // ... call the upstream ...
/// permit.record_success();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: Arc<GatekeeperConfig>,
    circuits: Mutex<HashMap<String, SharedCircuit>>,
}

impl CircuitBreaker {
    /// Create a breaker resolving policies from `config`.
    pub fn new(config: Arc<GatekeeperConfig>) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuit(&self, method: &str, key: &str) -> SharedCircuit {
        lock(&self.circuits)
            .entry(key.to_string())
            .or_insert_with(|| {
                let policy = self.config.for_method(method).circuit().clone();
                Arc::new(Mutex::new(Circuit::new(key, policy)))
            })
            .clone()
    }

    fn existing(&self, key: &str) -> Option<SharedCircuit> {
        lock(&self.circuits).get(key).cloned()
    }

    /// Take a permit for one upstream attempt.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` while the circuit is open and its cooldown has
    /// not elapsed, or while a half-open probe is outstanding.
    #[instrument(level = "debug", skip(self))]
    pub fn check(&self, method: &str, key: &str) -> CallResult<CircuitPermit> {
        let circuit = self.circuit(method, key);
        let (probe, generation) = {
            let mut state = lock(&circuit);
            let probe = state.admit(Instant::now())?;
            (probe, state.generation)
        };
        Ok(CircuitPermit {
            circuit,
            generation,
            probe,
            settled: false,
        })
    }

    /// Fail fast if the circuit for `key` is open and not yet probe-eligible.
    ///
    /// Takes no permit and never transitions the circuit.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` under the same condition as an open circuit in
    /// [`CircuitBreaker::check`].
    pub fn precheck(&self, key: &str) -> CallResult<()> {
        let Some(circuit) = self.existing(key) else {
            return Ok(());
        };
        let state = lock(&circuit);
        let now = Instant::now();
        match state.state {
            CircuitState::Open if state.next_probe_at.is_some_and(|at| now < at) => {
                Err(state.rejection(now))
            }
            _ => Ok(()),
        }
    }

    /// Resolves with a `CircuitOpen` error once the circuit for `key` opens.
    ///
    /// Resolves immediately if it is already open; never resolves for an
    /// unknown key.
    pub fn opened(&self, key: &str) -> impl Future<Output = CallError> + Send + 'static {
        let circuit = self.existing(key);
        let receiver = circuit.as_ref().map(|c| lock(c).notify.subscribe());
        async move {
            let (Some(circuit), Some(mut receiver)) = (circuit, receiver) else {
                return std::future::pending().await;
            };
            if receiver
                .wait_for(|state| *state == CircuitState::Open)
                .await
                .is_err()
            {
                return std::future::pending().await;
            }
            let state = lock(&circuit);
            state.rejection(Instant::now())
        }
    }

    /// Current state of the circuit for `key`; unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.existing(key)
            .map(|c| lock(&c).state)
            .unwrap_or_default()
    }

    /// Point-in-time view of the circuit for `key`, if it exists.
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let circuit = self.existing(key)?;
        let snapshot = lock(&circuit).snapshot(Instant::now());
        Some(snapshot)
    }
}

/// Permission for one upstream attempt.
///
/// Report the attempt through [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A probe permit dropped without
/// a report frees the half-open slot for the next caller.
#[derive(Debug)]
pub struct CircuitPermit {
    circuit: SharedCircuit,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    /// Whether this permit is the half-open trial call.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The attempt reached the upstream and was answered.
    pub fn record_success(self) {
        self.settle(false);
    }

    /// The attempt is evidence of an unhealthy upstream.
    pub fn record_failure(self) {
        self.settle(true);
    }

    fn settle(mut self, failed: bool) {
        self.settled = true;
        lock(&self.circuit).settle(self.generation, self.probe, failed, Instant::now());
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            lock(&self.circuit).abandon_probe(self.generation);
        }
    }
}

/// Observable state of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
pub struct CircuitSnapshot {
    /// Circuit key
    key: String,
    /// State machine position
    state: CircuitState,
    /// Cooldown applied the next time the circuit opens (or the current one)
    cooldown: Duration,
    /// Failures inside the rolling window
    failures: u32,
    /// Calls inside the rolling window
    calls: u32,
    /// Time until a probe is admitted, while open
    retry_in: Option<Duration>,
}
