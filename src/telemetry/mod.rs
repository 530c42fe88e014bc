//! Telemetry for the request queue and circuit breakers.
//!
//! Components emit [`PolicyEvent`]s on an [`EventBus`] they were handed at construction.
//! Nothing is emitted when no bus is attached, and subscribers never influence the
//! component that emitted the event.
//!
//! # Event Types
//!
//! - **Request queue**: `batch-processed` ([`BatchMetrics`])
//! - **Circuit breaker**: `state-change` ([`StateChange`])
//!
//! # Sinks
//!
//! [`TelemetrySink`] implementations ([`LogSink`], [`MemorySink`]) attach to a bus and
//! consume every event kind.

pub mod bus;
pub mod events;
pub mod sinks;

pub use bus::{Event, EventBus, Listener, ListenerId};
pub use events::{event_to_json, BatchMetrics, EventKind, PolicyEvent, StateChange};
pub use sinks::{LogSink, MemorySink, TelemetrySink};
