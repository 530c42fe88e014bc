#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # batchwire
//!
//! Resilient request execution for HTTP API clients: per-endpoint circuit breakers in
//! front of a queue that batches, deduplicates and demultiplexes many logical requests
//! into one round trip.
//!
//! ## Features
//!
//! - **Circuit breakers** with a rolling failure window and bounded half-open probing
//! - **Breaker registry** keyed by endpoint group, owned by the caller
//! - **Request queue** flushing on size or delay, with dedup fan-out and a failed buffer
//! - **Event bus** publishing `batch-processed` and `state-change` events
//! - **tower layer** for putting a breaker in front of any service
//!
//! ## Quick Start
//!
//! ```rust
//! use batchwire::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CircuitBreakerConfig::new(3, Duration::from_secs(30)).unwrap();
//!     let breaker = CircuitBreaker::new("cms", config);
//!
//!     let result = breaker
//!         .execute(|| async { Ok::<_, std::io::Error>("fresh content") })
//!         .await;
//!     assert!(result.is_ok());
//!
//!     let failed = breaker
//!         .execute(|| async {
//!             Err::<(), _>(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
//!         })
//!         .await;
//!     assert!(matches!(failed, Err(ResilienceError::Inner(_))));
//! }
//! ```

pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod client;
pub mod clock;
pub mod error;
pub mod middleware;
pub mod prelude;
pub mod queue;
pub mod sleeper;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use circuit_breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
pub use client::{ApiClient, ApiClientBuilder};
pub use clock::{Clock, ManualClock, MonotonicClock, TokioClock};
pub use error::{ConfigError, QueueError, ResilienceError};
pub use middleware::{CircuitBreakerLayer, CircuitBreakerService};
pub use queue::{BatchConfig, PendingResponse, QueueStats, RequestDescriptor, RequestQueue};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{EventBus, EventKind, PolicyEvent};
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};
