//! Per-key circuit breakers
//!
//! A [`CircuitBreakerRegistry`] guards protected calls behind named
//! circuits. Each circuit is a three-state machine:
//!
//! - **Closed**: calls pass through. Counted failures accumulate; reaching
//!   the threshold opens the circuit. A success while closed decrements the
//!   failure count by one (floor zero) — a sliding decay, so one success
//!   does not erase a burst of failures outright.
//! - **Open**: calls are rejected immediately with [`Error::CircuitOpen`]
//!   without invoking the operation. Once the reset timeout has elapsed the
//!   next admission lazily moves the circuit to half-open.
//! - **HalfOpen**: a bounded number of probe calls is admitted. One probe
//!   failure reopens the circuit; admission beyond the probe budget also
//!   reopens it. The circuit closes only after the probe budget's worth of
//!   consecutive successes.
//!
//! The registry is an explicit value: construct one and hand it (typically
//! behind an `Arc`) to whatever needs it. Nothing here is process-global.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Per-circuit options: thresholds plus the failure predicate and the
/// state-change observer.
#[derive(Clone, Default)]
pub struct CircuitBreakerOptions {
    pub config: CircuitBreakerConfig,
    is_failure: Option<FailurePredicate>,
    on_state_change: Option<StateChangeHook>,
}

impl CircuitBreakerOptions {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            is_failure: None,
            on_state_change: None,
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_max(mut self, max: u32) -> Self {
        self.config.half_open_max = max;
        self
    }

    /// Decide which errors count against the circuit. Default: all of them.
    /// Excluding expected business errors keeps them from tripping the
    /// breaker.
    pub fn is_failure(mut self, predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    /// Observe state transitions as `(key, from, to)`. Invoked after
    /// internal locks are released.
    pub fn on_state_change(
        mut self,
        hook: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    fn counts_as_failure(&self, error: &Error) -> bool {
        self.is_failure
            .as_ref()
            .map_or(true, |predicate| predicate(error))
    }

    fn probe_budget(&self) -> u32 {
        self.config.half_open_max.max(1)
    }
}

impl fmt::Debug for CircuitBreakerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerOptions")
            .field("config", &self.config)
            .field("is_failure", &self.is_failure.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

struct CircuitRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_probes_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    options: CircuitBreakerOptions,
}

impl CircuitRecord {
    fn new(options: CircuitBreakerOptions) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_probes_in_flight: 0,
            opened_at: None,
            last_failure_at: None,
            options,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.success_count = 0;
        self.half_open_probes_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_probes_in_flight = 0;
        self.opened_at = None;
    }
}

/// Read-only view of one circuit, for metrics and dashboards.
///
/// Reading a snapshot never mutates circuit state; in particular it does
/// not perform the lazy open→half-open transition.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_probes_in_flight: u32,
    /// How long the circuit has been open, when open
    pub open_for: Option<Duration>,
    /// Remaining cooldown before probes are admitted, when open
    pub retry_after: Option<Duration>,
    /// Age of the most recent counted failure
    pub last_failure_age: Option<Duration>,
}

/// Admission ticket for a protected call.
struct Admission {
    probe: bool,
}

/// Registry of named circuits.
pub struct CircuitBreakerRegistry {
    circuits: Mutex<HashMap<String, CircuitRecord>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("circuits", &self.lock().len())
            .finish()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitRecord>> {
        // state under the lock stays consistent even if a holder panicked
        self.circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a circuit under `key`. Idempotent: registering an existing
    /// key is a no-op and preserves its in-flight state.
    pub fn register(&self, key: impl Into<String>, options: CircuitBreakerOptions) {
        self.lock()
            .entry(key.into())
            .or_insert_with(|| CircuitRecord::new(options));
    }

    /// Run `operation` behind the circuit registered under `key`.
    ///
    /// An unregistered key is registered with default options first. When
    /// the circuit rejects the call, the operation is never invoked and the
    /// error carries the remaining cooldown.
    pub async fn execute<F, Fut, T>(&self, key: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit(key)?;
        let result = operation().await;
        self.settle(key, &admission, result.as_ref().err());
        result
    }

    /// Force a circuit back to closed, zeroing its counters. Operator
    /// override; a no-op for unknown keys.
    pub fn reset(&self, key: &str) {
        let transition = {
            let mut circuits = self.lock();
            match circuits.get_mut(key) {
                Some(record) if record.state != CircuitState::Closed => {
                    let from = record.state;
                    record.close();
                    Some((record.options.on_state_change.clone(), from))
                }
                Some(record) => {
                    record.close();
                    None
                }
                None => None,
            }
        };
        if let Some((hook, from)) = transition {
            self.notify(&hook, key, from, CircuitState::Closed);
        }
    }

    /// Read-only view of one circuit.
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        let circuits = self.lock();
        circuits.get(key).map(|record| {
            let now = Instant::now();
            let open_for = record.opened_at.map(|at| now.duration_since(at));
            let retry_after = match (record.state, open_for) {
                (CircuitState::Open, Some(elapsed)) => Some(
                    record
                        .options
                        .config
                        .reset_timeout
                        .saturating_sub(elapsed),
                ),
                _ => None,
            };
            CircuitSnapshot {
                key: key.to_string(),
                state: record.state,
                failure_count: record.failure_count,
                success_count: record.success_count,
                half_open_probes_in_flight: record.half_open_probes_in_flight,
                open_for,
                retry_after,
                last_failure_age: record.last_failure_at.map(|at| now.duration_since(at)),
            }
        })
    }

    /// Read-only views of every registered circuit.
    pub fn all_snapshots(&self) -> Vec<CircuitSnapshot> {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.iter()
            .filter_map(|key| self.snapshot(key))
            .collect()
    }

    /// Admit or reject a call, applying the lazy open→half-open transition.
    fn admit(&self, key: &str) -> Result<Admission> {
        let (outcome, transition) = {
            let mut circuits = self.lock();
            let record = circuits
                .entry(key.to_string())
                .or_insert_with(|| CircuitRecord::new(CircuitBreakerOptions::default()));
            let now = Instant::now();

            match record.state {
                CircuitState::Closed => ((Ok(Admission { probe: false })), None),
                CircuitState::Open => {
                    let elapsed = record
                        .opened_at
                        .map(|at| now.duration_since(at))
                        .unwrap_or_default();
                    let reset_timeout = record.options.config.reset_timeout;
                    if elapsed >= reset_timeout {
                        record.state = CircuitState::HalfOpen;
                        record.success_count = 0;
                        record.half_open_probes_in_flight = 1;
                        (
                            Ok(Admission { probe: true }),
                            Some((
                                record.options.on_state_change.clone(),
                                CircuitState::Open,
                                CircuitState::HalfOpen,
                            )),
                        )
                    } else {
                        (
                            Err(Error::CircuitOpen {
                                key: key.to_string(),
                                retry_after: reset_timeout - elapsed,
                            }),
                            None,
                        )
                    }
                }
                CircuitState::HalfOpen => {
                    if record.half_open_probes_in_flight < record.options.probe_budget() {
                        record.half_open_probes_in_flight += 1;
                        (Ok(Admission { probe: true }), None)
                    } else {
                        // probe budget blown: back to open
                        record.open(now);
                        (
                            Err(Error::CircuitOpen {
                                key: key.to_string(),
                                retry_after: record.options.config.reset_timeout,
                            }),
                            Some((
                                record.options.on_state_change.clone(),
                                CircuitState::HalfOpen,
                                CircuitState::Open,
                            )),
                        )
                    }
                }
            }
        };
        if let Some((hook, from, to)) = transition {
            self.notify(&hook, key, from, to);
        }
        outcome
    }

    /// Record the outcome of an admitted call.
    fn settle(&self, key: &str, admission: &Admission, error: Option<&Error>) {
        let transition = {
            let mut circuits = self.lock();
            let Some(record) = circuits.get_mut(key) else {
                return;
            };
            if admission.probe {
                record.half_open_probes_in_flight =
                    record.half_open_probes_in_flight.saturating_sub(1);
            }
            let failed = error.is_some_and(|e| record.options.counts_as_failure(e));
            let now = Instant::now();

            match (record.state, failed) {
                (CircuitState::Closed, false) => {
                    record.failure_count = record.failure_count.saturating_sub(1);
                    None
                }
                (CircuitState::Closed, true) => {
                    record.failure_count += 1;
                    record.last_failure_at = Some(now);
                    if record.failure_count >= record.options.config.failure_threshold.max(1) {
                        record.open(now);
                        Some((
                            record.options.on_state_change.clone(),
                            CircuitState::Closed,
                            CircuitState::Open,
                        ))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, false) => {
                    record.success_count += 1;
                    if record.success_count >= record.options.probe_budget() {
                        record.close();
                        Some((
                            record.options.on_state_change.clone(),
                            CircuitState::HalfOpen,
                            CircuitState::Closed,
                        ))
                    } else {
                        None
                    }
                }
                (CircuitState::HalfOpen, true) => {
                    // one strike while half-open reopens the circuit
                    record.last_failure_at = Some(now);
                    record.open(now);
                    Some((
                        record.options.on_state_change.clone(),
                        CircuitState::HalfOpen,
                        CircuitState::Open,
                    ))
                }
                (CircuitState::Open, _) => {
                    // a probe settling after another probe reopened the
                    // circuit; nothing further to record
                    if failed {
                        record.last_failure_at = Some(now);
                    }
                    None
                }
            }
        };
        if let Some((hook, from, to)) = transition {
            self.notify(&hook, key, from, to);
        }
    }

    fn notify(
        &self,
        hook: &Option<StateChangeHook>,
        key: &str,
        from: CircuitState,
        to: CircuitState,
    ) {
        info!(circuit = %key, %from, %to, "circuit state change");
        if let Some(hook) = hook {
            hook(key, from, to);
        }
    }
}
