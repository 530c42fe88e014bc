//! Circuit breaker guarding an async operation.
//!
//! State lives behind a `std::sync::Mutex` that is only held for bookkeeping, never across
//! the wrapped operation's `.await`. Clones share the same state, so every handle observes
//! and affects the same lifecycle.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::telemetry::{EventBus, PolicyEvent, StateChange};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the reset timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    failure_window: Duration,
    reset_timeout: Duration,
    half_open_limit: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            half_open_limit: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Config with the given threshold and cooldown; window and probe limit keep their
    /// defaults (60s, 1).
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, ConfigError> {
        Self::builder().failure_threshold(failure_threshold).reset_timeout(reset_timeout).build()
    }

    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// A breaker that never opens and records nothing.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            failure_window: Duration::MAX,
            reset_timeout: Duration::MAX,
            half_open_limit: usize::MAX,
        }
    }

    /// Failures inside the window that open the circuit.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn failure_window(&self) -> Duration {
        self.failure_window
    }

    /// Time to stay Open before probing.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    /// Probes per half-open round.
    pub fn half_open_limit(&self) -> usize {
        self.half_open_limit
    }

    fn is_disabled(&self) -> bool {
        self.failure_threshold == usize::MAX
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold { provided: 0 });
        }
        if self.half_open_limit == 0 {
            return Err(ConfigError::InvalidHalfOpenLimit { provided: 0 });
        }
        if self.failure_window == Duration::ZERO {
            return Err(ConfigError::InvalidFailureWindow(self.failure_window));
        }
        if self.reset_timeout == Duration::ZERO && !self.is_disabled() {
            return Err(ConfigError::InvalidResetTimeout(self.reset_timeout));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.config.failure_window = window;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn half_open_limit(mut self, limit: usize) -> Self {
        self.config.half_open_limit = limit;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub total_requests: u64,
    /// Calls rejected without invoking the operation.
    pub rejected_requests: u64,
    pub state_changed_at_millis: u64,
    pub half_open_in_flight: usize,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failures: VecDeque<u64>,
    opened_at: u64,
    state_changed_at: u64,
    // Bumped on every entry into HalfOpen; outcomes from older rounds are ignored.
    round: u64,
    probes_admitted: usize,
    probes_in_flight: usize,
    probes_succeeded: usize,
    total_requests: u64,
    rejected_requests: u64,
}

impl BreakerCore {
    fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: 0,
            state_changed_at: now,
            round: 0,
            probes_admitted: 0,
            probes_in_flight: 0,
            probes_succeeded: 0,
            total_requests: 0,
            rejected_requests: 0,
        }
    }

    fn prune(&mut self, now: u64, window: Duration) {
        let window = as_millis(window);
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_sub(oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, key: &str, to: CircuitState, now: u64) -> StateChange {
        let from = self.state;
        self.state = to;
        self.state_changed_at = now;
        self.probes_admitted = 0;
        self.probes_in_flight = 0;
        self.probes_succeeded = 0;
        match to {
            CircuitState::Open => self.opened_at = now,
            CircuitState::HalfOpen => self.round += 1,
            CircuitState::Closed => self.failures.clear(),
        }
        StateChange { key: key.to_string(), from, to, failures: self.failures.len() }
    }
}

enum Admission<'a> {
    Closed,
    Probe(ProbeGuard<'a>),
}

/// Releases a probe slot if the probe never reports an outcome (dropped or panicked).
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    round: u64,
    settled: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut core = self.breaker.lock();
        if core.state == CircuitState::HalfOpen && core.round == self.round {
            core.probes_admitted = core.probes_admitted.saturating_sub(1);
            core.probes_in_flight = core.probes_in_flight.saturating_sub(1);
            tracing::debug!(key = %self.breaker.key, "half-open probe abandoned; slot released");
        }
    }
}

/// Per-key circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    key: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: Option<EventBus<PolicyEvent>>,
    core: Arc<Mutex<BreakerCore>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker for `key` using a validated config.
    ///
    /// # Examples
    /// ```
    /// use batchwire::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, Duration::from_secs(30)).unwrap();
    /// let breaker = CircuitBreaker::new("cms", config);
    /// ```
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Self::with_parts(key.into(), config, clock, None)
    }

    pub(crate) fn with_parts(
        key: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        events: Option<EventBus<PolicyEvent>>,
    ) -> Self {
        let core = BreakerCore::new(clock.now_millis());
        Self { key: key.into(), config, clock, events, core: Arc::new(Mutex::new(core)) }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Publish `state-change` events on `bus`.
    pub fn with_events(mut self, bus: EventBus<PolicyEvent>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Behavior
    /// - **Closed**: runs the operation. A failure is recorded; once `failure_threshold`
    ///   failures fall inside `failure_window` the circuit opens.
    /// - **Open**: rejects without running the operation until `reset_timeout` has elapsed,
    ///   then moves to HalfOpen for this call.
    /// - **HalfOpen**: at most `half_open_limit` probes run. When all of them succeed the
    ///   circuit closes; the first failing probe reopens it.
    ///
    /// # Errors
    /// `ResilienceError::CircuitOpen` when rejected (not counted as a failure);
    /// `ResilienceError::Inner(E)` with the operation's own error otherwise.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let admission = self.admit()?;
        let result = operation().await;
        self.settle(admission, result.is_ok());
        result.map_err(ResilienceError::Inner)
    }

    /// Current state without side effects. An Open breaker whose cooldown has elapsed
    /// still reports `Open` until the next call probes it.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let now = self.clock.now_millis();
        let mut core = self.lock();
        if core.state == CircuitState::Closed {
            core.prune(now, self.config.failure_window);
        }
        BreakerMetrics {
            state: core.state,
            failures_in_window: core.failures.len(),
            total_requests: core.total_requests,
            rejected_requests: core.rejected_requests,
            state_changed_at_millis: core.state_changed_at,
            half_open_in_flight: core.probes_in_flight,
        }
    }

    /// Force the breaker Closed and clear its failure history.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let change = {
            let mut core = self.lock();
            if core.state == CircuitState::Closed {
                core.failures.clear();
                None
            } else {
                Some(core.transition(&self.key, CircuitState::Closed, now))
            }
        };
        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn admit<E>(&self) -> Result<Admission<'_>, ResilienceError<E>> {
        let now = self.clock.now_millis();
        let mut change = None;
        let admission = {
            let mut core = self.lock();
            core.total_requests += 1;

            if core.state == CircuitState::Open {
                let elapsed = now.saturating_sub(core.opened_at);
                if elapsed >= as_millis(self.config.reset_timeout) {
                    change = Some(core.transition(&self.key, CircuitState::HalfOpen, now));
                }
            }

            let state = core.state;
            match state {
                CircuitState::Closed => Ok(Admission::Closed),
                CircuitState::HalfOpen if core.probes_admitted < self.config.half_open_limit => {
                    core.probes_admitted += 1;
                    core.probes_in_flight += 1;
                    tracing::debug!(
                        key = %self.key,
                        in_flight = core.probes_in_flight,
                        max = self.config.half_open_limit,
                        "circuit breaker: half-open probe"
                    );
                    Ok(Admission::Probe(ProbeGuard { breaker: self, round: core.round, settled: false }))
                }
                CircuitState::HalfOpen | CircuitState::Open => {
                    core.rejected_requests += 1;
                    Err(self.open_error(&core, now))
                }
            }
        };
        if let Some(change) = change {
            self.publish(change);
        }
        admission
    }

    fn settle(&self, admission: Admission<'_>, success: bool) {
        let now = self.clock.now_millis();
        let change = {
            let mut core = self.lock();
            match admission {
                Admission::Closed => {
                    if success || core.state != CircuitState::Closed || self.config.is_disabled() {
                        None
                    } else {
                        core.failures.push_back(now);
                        core.prune(now, self.config.failure_window);
                        if core.failures.len() >= self.config.failure_threshold {
                            Some(core.transition(&self.key, CircuitState::Open, now))
                        } else {
                            None
                        }
                    }
                }
                Admission::Probe(mut guard) => {
                    guard.settled = true;
                    if core.state != CircuitState::HalfOpen || core.round != guard.round {
                        tracing::debug!(key = %self.key, "ignoring outcome of a stale probe");
                        None
                    } else if success {
                        core.probes_in_flight = core.probes_in_flight.saturating_sub(1);
                        core.probes_succeeded += 1;
                        if core.probes_succeeded >= self.config.half_open_limit {
                            Some(core.transition(&self.key, CircuitState::Closed, now))
                        } else {
                            None
                        }
                    } else {
                        core.failures.push_back(now);
                        Some(core.transition(&self.key, CircuitState::Open, now))
                    }
                }
            }
        };
        if let Some(change) = change {
            self.publish(change);
        }
    }

    fn open_error<E>(&self, core: &BreakerCore, now: u64) -> ResilienceError<E> {
        let open_for = now.saturating_sub(core.opened_at);
        let retry_after = match core.state {
            CircuitState::Open => as_millis(self.config.reset_timeout).saturating_sub(open_for),
            _ => 0,
        };
        ResilienceError::CircuitOpen {
            key: self.key.to_string(),
            failure_count: core.failures.len(),
            open_duration: Duration::from_millis(open_for),
            retry_after: Duration::from_millis(retry_after),
        }
    }

    // Called with the lock released so listeners may inspect the breaker.
    fn publish(&self, change: StateChange) {
        match (change.from, change.to) {
            (CircuitState::HalfOpen, CircuitState::Open) => {
                tracing::warn!(key = %change.key, failures = change.failures, "circuit breaker: probe failed → open")
            }
            (_, CircuitState::Open) => tracing::error!(
                key = %change.key,
                failures = change.failures,
                threshold = self.config.failure_threshold,
                "circuit breaker → open"
            ),
            (_, CircuitState::HalfOpen) => tracing::info!(key = %change.key, "circuit breaker → half-open"),
            (_, CircuitState::Closed) => tracing::info!(key = %change.key, "circuit breaker → closed"),
        }
        if let Some(bus) = &self.events {
            bus.emit(&PolicyEvent::StateChange(change));
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(crate) fn shares_state_with(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
