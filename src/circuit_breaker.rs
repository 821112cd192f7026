//! Circuit Breaker
//!
//! Per-call-site state machine that stops invoking a failing dependency.
//!
//! - `Closed`: calls pass through; outcomes are kept in a sliding window of
//!   `monitoring_period`. The circuit opens once the window holds at least
//!   `volume_threshold` calls and `failure_threshold` of them failed.
//! - `Open`: every call is rejected without running. After `reset_timeout`
//!   the next caller moves the circuit to `HalfOpen`.
//! - `HalfOpen`: up to `half_open_max_attempts` trial calls run. A trial
//!   success closes the circuit and clears the window; a trial failure
//!   reopens it and restarts the reset timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{ms_to_utc, Clock, MonotonicClock};
use crate::error::CoordinatorError;
use crate::metrics;

/// Hint returned while every half-open trial slot is taken
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value exported on the state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures within the window needed to open
    pub failure_threshold: u32,

    /// Calls within the window needed before the circuit may open
    pub volume_threshold: u32,

    /// Length of the sliding window
    pub monitoring_period: Duration,

    /// Time spent open before trial calls are allowed
    pub reset_timeout: Duration,

    /// Concurrent trial calls allowed while half-open
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            volume_threshold: 10,
            monitoring_period: Duration::from_secs(300),
            reset_timeout: Duration::from_secs(60),
            half_open_max_attempts: 1,
        }
    }
}

/// Error from [`CircuitBreaker::execute`]
#[derive(Debug)]
pub enum CircuitError<E> {
    /// The call was not attempted
    Open { name: String, retry_after: Duration },

    /// The call ran and failed
    Call(E),
}

impl<E> CircuitError<E> {
    /// Convert a rejection into the coordinator taxonomy, mapping call errors with `f`
    pub fn into_coordinator(self, f: impl FnOnce(E) -> CoordinatorError) -> CoordinatorError {
        match self {
            CircuitError::Open { name, retry_after } => {
                CoordinatorError::CircuitOpen { name, retry_after }
            }
            CircuitError::Call(err) => f(err),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { name, retry_after } => write!(
                f,
                "Circuit '{}' is open, retry in {}s",
                name,
                retry_after.as_secs()
            ),
            CircuitError::Call(err) => err.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitError<E> {}

/// Observable breaker state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub window_start: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,

    /// Time until trial calls are allowed, when open
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,

    /// Outcomes of completed calls while closed, one slot per millisecond
    window: VecDeque<WindowSlot>,

    /// Running totals over `window`
    successes: u32,
    failures: u32,

    last_state_change_at_ms: u64,
    half_open_in_flight: u32,
}

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    at_ms: u64,
    successes: u32,
    failures: u32,
}

impl BreakerState {
    fn record(&mut self, now_ms: u64, success: bool) {
        let (successes, failures) = if success { (1, 0) } else { (0, 1) };
        self.successes += successes;
        self.failures += failures;

        if let Some(slot) = self.window.back_mut().filter(|slot| slot.at_ms == now_ms) {
            slot.successes += successes;
            slot.failures += failures;
            return;
        }
        self.window.push_back(WindowSlot {
            at_ms: now_ms,
            successes,
            failures,
        });
    }

    fn prune(&mut self, now_ms: u64, period: Duration) {
        let cutoff = now_ms.saturating_sub(period.as_millis() as u64);
        while let Some(slot) = self.window.front().copied().filter(|slot| slot.at_ms < cutoff) {
            self.successes -= slot.successes;
            self.failures -= slot.failures;
            self.window.pop_front();
        }
    }

    fn clear(&mut self) {
        self.window.clear();
        self.successes = 0;
        self.failures = 0;
    }

    fn failures(&self) -> u32 {
        self.failures
    }

    fn successes(&self) -> u32 {
        self.successes
    }

    fn volume(&self) -> u32 {
        self.successes + self.failures
    }
}

/// Circuit breaker for one protected call site
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one call. A trial slot is returned if the call is
/// dropped before reporting an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut state = self.breaker.lock();
            if state.state == CircuitState::HalfOpen {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    /// Create a breaker on the monotonic clock
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::new()))
    }

    /// Create a breaker on a specific clock
    pub fn with_clock(name: &str, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now_ms = clock.now_ms();
        metrics::CIRCUIT_STATE
            .with_label_values(&[name])
            .set(CircuitState::Closed.as_gauge());
        Self {
            name: name.to_string(),
            config,
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                successes: 0,
                failures: 0,
                last_state_change_at_ms: now_ms,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, promoting an expired `Open` to `HalfOpen`
    pub fn state(&self) -> CircuitState {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        self.maybe_half_open(&mut state, now_ms);
        state.state
    }

    /// Run `call` through the breaker.
    ///
    /// Rejected calls are never invoked. Every error returned by `call`
    /// counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit()?;
        match call().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(CircuitError::Call(err))
            }
        }
    }

    /// How long a call made now would be refused for, without taking a trial slot
    pub fn rejection(&self) -> Option<Duration> {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        self.maybe_half_open(&mut state, now_ms);
        match state.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => (state.half_open_in_flight
                >= self.config.half_open_max_attempts)
                .then_some(HALF_OPEN_RETRY_HINT),
            CircuitState::Open => Some(self.open_remaining(&state, now_ms)),
        }
    }

    /// Force the breaker closed and clear the window
    pub fn reset(&self) {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        state.clear();
        self.transition(&mut state, CircuitState::Closed, now_ms);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        self.maybe_half_open(&mut state, now_ms);
        state.prune(now_ms, self.config.monitoring_period);

        let retry_after_ms = (state.state == CircuitState::Open)
            .then(|| self.open_remaining(&state, now_ms).as_millis() as u64);
        let window_start = state.window.front().map(|slot| slot.at_ms).unwrap_or(now_ms);

        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failures(),
            success_count: state.successes(),
            window_start: ms_to_utc(window_start),
            last_state_change_at: ms_to_utc(state.last_state_change_at_ms),
            retry_after_ms,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit<E>(&self) -> Result<Permit<'_>, CircuitError<E>> {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        self.maybe_half_open(&mut state, now_ms);

        let rejection = match state.state {
            CircuitState::Closed => {
                return Ok(Permit {
                    breaker: self,
                    trial: false,
                    settled: false,
                })
            }
            CircuitState::HalfOpen if state.half_open_in_flight < self.config.half_open_max_attempts => {
                state.half_open_in_flight += 1;
                debug!(circuit = %self.name, "Admitting trial call");
                return Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                });
            }
            CircuitState::HalfOpen => HALF_OPEN_RETRY_HINT,
            CircuitState::Open => self.open_remaining(&state, now_ms),
        };

        metrics::CIRCUIT_REJECTIONS_TOTAL
            .with_label_values(&[self.name.as_str()])
            .inc();
        Err(CircuitError::Open {
            name: self.name.clone(),
            retry_after: rejection,
        })
    }

    fn open_remaining(&self, state: &BreakerState, now_ms: u64) -> Duration {
        let elapsed = now_ms.saturating_sub(state.last_state_change_at_ms);
        let timeout = self.config.reset_timeout.as_millis() as u64;
        Duration::from_millis(timeout.saturating_sub(elapsed))
    }

    fn maybe_half_open(&self, state: &mut BreakerState, now_ms: u64) {
        if state.state == CircuitState::Open && self.open_remaining(state, now_ms).is_zero() {
            state.half_open_in_flight = 0;
            self.transition(state, CircuitState::HalfOpen, now_ms);
        }
    }

    fn on_success(&self, trial: bool) {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen if trial => {
                state.clear();
                state.half_open_in_flight = 0;
                self.transition(&mut state, CircuitState::Closed, now_ms);
            }
            CircuitState::Closed => {
                state.record(now_ms, true);
                self.maybe_open(&mut state, now_ms);
            }
            // Calls admitted before the circuit tripped do not move it
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now_ms = self.clock.now_ms();
        let mut state = self.lock();
        match state.state {
            CircuitState::HalfOpen if trial => {
                state.half_open_in_flight = 0;
                self.transition(&mut state, CircuitState::Open, now_ms);
            }
            CircuitState::Closed => {
                state.record(now_ms, false);
                self.maybe_open(&mut state, now_ms);
            }
            _ => {}
        }
    }

    fn maybe_open(&self, state: &mut BreakerState, now_ms: u64) {
        state.prune(now_ms, self.config.monitoring_period);
        let volume = state.volume();
        let failures = state.failures();
        if volume >= self.config.volume_threshold && failures >= self.config.failure_threshold {
            self.transition(state, CircuitState::Open, now_ms);
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now_ms: u64) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;
        state.last_state_change_at_ms = now_ms;
        metrics::CIRCUIT_STATE
            .with_label_values(&[self.name.as_str()])
            .set(to.as_gauge());

        match to {
            CircuitState::Open => warn!(
                circuit = %self.name,
                from = %from,
                failures = state.failures(),
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(circuit = %self.name, "Circuit half-open, allowing trial calls"),
            CircuitState::Closed => info!(circuit = %self.name, from = %from, "Circuit closed"),
        }
    }
}

/// One breaker per operation, created at startup and never removed
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new<I, S>(names: I, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let breakers = names
            .into_iter()
            .map(|name| {
                let name = name.as_ref();
                let breaker = CircuitBreaker::with_clock(name, config.clone(), Arc::clone(&clock));
                (name.to_string(), Arc::new(breaker))
            })
            .collect();
        Self { breakers }
    }

    /// Breaker guarding `name`
    pub fn get(&self, name: &str) -> Result<&Arc<CircuitBreaker>, CoordinatorError> {
        self.breakers
            .get(name)
            .ok_or_else(|| CoordinatorError::UnknownOperation(name.to_string()))
    }

    /// Snapshots sorted by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Re-read every breaker so timed-out `Open` states surface as `HalfOpen`
    pub fn refresh(&self) {
        for breaker in self.breakers.values() {
            breaker.state();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
