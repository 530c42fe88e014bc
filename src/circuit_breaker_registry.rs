//! Registry of per-key circuit breakers.
//!
//! Owned by whoever builds it (normally the API client) and passed around explicitly;
//! there is no process-wide instance. Breakers are created lazily on first use of a key.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{EventBus, PolicyEvent};

/// Errors from breaker registries.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The requested circuit breaker key was not found.
    #[error("circuit breaker '{key}' not found")]
    NotFound { key: String },
}

/// Key → breaker map with race-free get-or-create.
#[derive(Clone, Debug)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus<PolicyEvent>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(MonotonicClock::default()),
            events: None,
        }
    }

    /// Clock handed to every breaker created from now on.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Bus handed to every breaker created from now on.
    pub fn with_events(mut self, bus: EventBus<PolicyEvent>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Return the breaker for `key`, creating it with `config` on first use.
    ///
    /// Later calls return the same breaker whatever config they pass; the config is fixed
    /// when the breaker is created.
    pub fn get_or_create(&self, key: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(key, "creating circuit breaker");
                CircuitBreaker::with_parts(
                    key.to_string(),
                    config,
                    self.clock.clone(),
                    self.events.clone(),
                )
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<CircuitBreaker> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    /// Reset a breaker by key, erroring if missing.
    pub fn reset(&self, key: &str) -> Result<(), RegistryError> {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { key: key.to_string() }),
        }
    }

    /// Snapshot breaker states sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
