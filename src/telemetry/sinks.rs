use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::bus::{EventBus, ListenerId};
use super::events::{EventKind, PolicyEvent};

const ALL_KINDS: [EventKind; 2] = [EventKind::BatchProcessed, EventKind::StateChange];

/// A consumer of policy events that can attach itself to a bus.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, event: &PolicyEvent);

    /// Subscribe this sink to every event kind on `bus`.
    fn attach(self: Arc<Self>, bus: &EventBus<PolicyEvent>) -> Vec<ListenerId>
    where
        Self: Sized,
    {
        ALL_KINDS
            .iter()
            .map(|kind| {
                let sink = self.clone();
                bus.on(*kind, move |event: &PolicyEvent| sink.record(event))
            })
            .collect()
    }
}

/// Logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, event: &PolicyEvent) {
        match event {
            PolicyEvent::BatchProcessed(m) if m.error_count > 0 => {
                tracing::warn!(event = %event, "policy_event")
            }
            PolicyEvent::StateChange(_) => tracing::warn!(event = %event, "policy_event"),
            _ => tracing::info!(event = %event, "policy_event"),
        }
    }
}

/// Stores events in memory, evicting the oldest once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Only the `batch-processed` payloads, oldest first.
    pub fn batches(&self) -> Vec<super::events::BatchMetrics> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                PolicyEvent::BatchProcessed(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Only the `state-change` payloads, oldest first.
    pub fn state_changes(&self) -> Vec<super::events::StateChange> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                PolicyEvent::StateChange(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&self, event: &PolicyEvent) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event.clone());
    }
}
