//! Typed publish/subscribe bus.
//!
//! Dispatch is synchronous, in registration order. Each listener call runs inside its own
//! `catch_unwind` boundary: a panicking subscriber is logged and skipped, and neither the
//! emitter nor sibling subscribers are affected. The listener list is snapshotted before
//! dispatch, so listeners may subscribe or unsubscribe from inside a callback.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// An event that can travel over an [`EventBus`].
pub trait Event: Send + Sync + 'static {
    /// Event name used for subscription.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Subscriber callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct BusInner<E: Event> {
    listeners: RwLock<HashMap<E::Kind, Vec<(ListenerId, Listener<E>)>>>,
    next_id: AtomicU64,
}

/// Cheaply cloneable event bus; clones share subscribers.
pub struct EventBus<E: Event> {
    inner: Arc<BusInner<E>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&E::Kind, usize> = map.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe `callback` to events of `kind`.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(kind).or_default().push((id, Arc::new(callback)));
        id
    }

    /// Unsubscribe; returns whether the listener was registered under `kind`.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut map = self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = map.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&kind);
        }
        removed
    }

    /// Deliver `event` to every subscriber of its kind. Returns how many listeners
    /// completed without panicking.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener<E>> = {
            let map = self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(&kind) {
                Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(kind = ?kind, panic = %message, "event listener panicked");
                }
            }
        }
        delivered
    }

    /// Drop subscribers of `kind`, or of every kind when `None`.
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let mut map = self.inner.listeners.write().unwrap_or_else(PoisonError::into_inner);
        match kind {
            Some(kind) => {
                map.remove(&kind);
            }
            None => map.clear(),
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        let map = self.inner.listeners.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&kind).map_or(0, Vec::len)
    }
}
