use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::bus::Event;
use crate::circuit_breaker::CircuitState;

/// Operational events emitted by the queue and the breakers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PolicyEvent {
    /// A batch settled (successfully or not).
    BatchProcessed(BatchMetrics),
    /// A circuit breaker changed state.
    StateChange(StateChange),
}

/// Subscription key for [`PolicyEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BatchProcessed,
    StateChange,
}

impl EventKind {
    /// Wire/metric name of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BatchProcessed => "batch-processed",
            EventKind::StateChange => "state-change",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event for PolicyEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            PolicyEvent::BatchProcessed(_) => EventKind::BatchProcessed,
            PolicyEvent::StateChange(_) => EventKind::StateChange,
        }
    }
}

/// Payload of `batch-processed`.
///
/// Counts are per caller: deduplicated callers that shared one wire item each count once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMetrics {
    pub batch_id: String,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    pub success_count: usize,
    pub error_count: usize,
    /// Requests still waiting in the queue when the batch settled.
    pub queue_size_remaining: usize,
}

/// Payload of `state-change`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    /// Failures inside the window at the time of the transition.
    pub failures: usize,
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::BatchProcessed(m) => write!(
                f,
                "BatchProcessed({}, ok={}, err={}, remaining={}, duration={:?})",
                m.batch_id, m.success_count, m.error_count, m.queue_size_remaining, m.duration
            ),
            PolicyEvent::StateChange(c) => {
                write!(f, "StateChange({}: {:?} -> {:?}, failures={})", c.key, c.from, c.to, c.failures)
            }
        }
    }
}

/// Convert an event into JSON for log shipping.
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    serde_json::to_value(event).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics() -> BatchMetrics {
        BatchMetrics {
            batch_id: "batch-3".into(),
            duration: Duration::from_millis(12),
            success_count: 2,
            error_count: 1,
            queue_size_remaining: 0,
        }
    }

    #[test]
    fn kinds_use_metric_names() {
        let event = PolicyEvent::BatchProcessed(metrics());
        assert_eq!(event.kind(), EventKind::BatchProcessed);
        assert_eq!(event.kind().to_string(), "batch-processed");
        assert_eq!(EventKind::StateChange.as_str(), "state-change");
    }

    #[test]
    fn batch_event_json_shape() {
        let value = event_to_json(&PolicyEvent::BatchProcessed(metrics()));
        assert_eq!(
            value,
            json!({
                "event": "batch-processed",
                "batch_id": "batch-3",
                "duration_ms": 12,
                "success_count": 2,
                "error_count": 1,
                "queue_size_remaining": 0
            })
        );
    }

    #[test]
    fn state_change_display() {
        let event = PolicyEvent::StateChange(StateChange {
            key: "cms".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            failures: 2,
        });
        assert_eq!(event.to_string(), "StateChange(cms: Closed -> Open, failures=2)");
        assert_eq!(event_to_json(&event)["to"], json!("open"));
    }
}
