//! Convenient re-exports for common batchwire types.
pub use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    client::ApiClient,
    error::{ConfigError, QueueError, ResilienceError},
    middleware::CircuitBreakerLayer,
    queue::{BatchConfig, RequestDescriptor, RequestQueue},
    telemetry::{BatchMetrics, EventBus, EventKind, PolicyEvent, StateChange},
    transport::{Transport, TransportError, TransportRequest, TransportResponse},
};
