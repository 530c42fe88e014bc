//! Request batching queue.
//!
//! Callers [`submit`](RequestQueue::submit) logical requests and get a
//! [`PendingResponse`] back. Requests accumulate until either `max_batch_size` of them are
//! pending (flush immediately) or the oldest has waited `max_delay` (timer flush). Each
//! flush becomes one POST to the batch endpoint; identical `(method, url)` requests in a
//! batch travel once and every caller receives the shared result.
//!
//! Batch-level failures (transport error, non-2xx status, malformed response) fail every
//! request of the batch with the same error and move their descriptors to a failed buffer
//! that [`retry_failed`](RequestQueue::retry_failed) resubmits.
//!
//! ```no_run
//! use batchwire::queue::{BatchConfig, RequestDescriptor, RequestQueue};
//! use batchwire::transport::{Transport, TransportError, TransportRequest, TransportResponse};
//!
//! #[derive(Debug)]
//! struct Cms;
//!
//! #[async_trait::async_trait]
//! impl Transport for Cms {
//!     async fn send(&self, _: TransportRequest) -> Result<TransportResponse, TransportError> {
//!         Ok(TransportResponse::json(&serde_json::json!({ "data": [{ "data": "hello" }] })))
//!     }
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatchConfig::builder().max_batch_size(10).build()?;
//! let queue = RequestQueue::builder("https://cms.example.com", Cms).config(config).build()?;
//! let post = queue.enqueue(RequestDescriptor::get("/posts/1")).await?;
//! assert_eq!(post, "hello");
//! # Ok(())
//! # }
//! ```

mod config;
mod request;
pub mod wire;

pub use config::{BatchConfig, BatchConfigBuilder};
pub use request::RequestDescriptor;

use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use url::{Position, Url};

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, QueueError};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{BatchMetrics, EventBus, PolicyEvent};
use crate::transport::{Transport, TransportError, TransportRequest};
use wire::{BatchPayloadItem, ItemResult, BATCH_MARKER_HEADER};

type Settle = oneshot::Sender<Result<Value, QueueError>>;

/// Handle to a submitted request; resolves when its batch settles.
#[derive(Debug)]
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value, QueueError>>,
}

impl Future for PendingResponse {
    type Output = Result<Value, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(QueueError::Abandoned)))
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    /// Clock reading at which the oldest pending request was admitted.
    pub oldest_enqueued_at: Option<u64>,
    pub timer_armed: bool,
}

struct QueuedRequest {
    descriptor: RequestDescriptor,
    target: Url,
    body: Option<Value>,
    settle: Settle,
    enqueued_at: u64,
}

impl QueuedRequest {
    fn payload_item(&self, id: usize) -> BatchPayloadItem {
        BatchPayloadItem {
            id,
            url: self.target[Position::BeforePath..].to_string(),
            method: self.descriptor.method().to_string(),
            headers: self.descriptor.headers().clone(),
            body: self.body.clone(),
        }
    }
}

/// Requests sharing one wire item.
struct WireGroup {
    primary: QueuedRequest,
    duplicates: Vec<QueuedRequest>,
}

impl WireGroup {
    fn len(&self) -> usize {
        1 + self.duplicates.len()
    }

    fn members(self) -> impl Iterator<Item = QueuedRequest> {
        std::iter::once(self.primary).chain(self.duplicates)
    }
}

fn group_batch(batch: Vec<QueuedRequest>, deduplicate: bool) -> Vec<WireGroup> {
    if !deduplicate {
        return batch
            .into_iter()
            .map(|primary| WireGroup { primary, duplicates: Vec::new() })
            .collect();
    }
    let mut groups: Vec<WireGroup> = Vec::with_capacity(batch.len());
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for request in batch {
        let key = (request.descriptor.method().to_string(), request.target.to_string());
        match index.get(&key) {
            Some(&at) => groups[at].duplicates.push(request),
            None => {
                index.insert(key, groups.len());
                groups.push(WireGroup { primary: request, duplicates: Vec::new() });
            }
        }
    }
    groups
}

struct ScheduledFlush {
    id: u64,
    handle: AbortHandle,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedRequest>,
    failed: Vec<RequestDescriptor>,
    scheduled: Option<ScheduledFlush>,
    in_flight: usize,
}

impl QueueState {
    fn cancel_timer(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.handle.abort();
        }
    }

    fn take_batch(&mut self, max: usize) -> Vec<QueuedRequest> {
        let n = self.pending.len().min(max);
        let batch: Vec<QueuedRequest> = self.pending.drain(..n).collect();
        self.in_flight += batch.len();
        batch
    }
}

struct QueueInner {
    config: BatchConfig,
    origin: Url,
    batch_url: Url,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus<PolicyEvent>>,
    state: Mutex<QueueState>,
    next_batch: AtomicU64,
    next_timer: AtomicU64,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, raw: &str) -> Result<Url, QueueError> {
        resolve_on_origin(&self.origin, raw)
    }
}

/// Resolve `raw` against `origin`, rejecting anything that lands on another origin.
///
/// Relative paths and scheme-relative URLs (`//host/path`) are joined onto `origin` first,
/// so both forms are subject to the same check as absolute URLs.
fn resolve_on_origin(origin: &Url, raw: &str) -> Result<Url, QueueError> {
    let invalid = |e: url::ParseError| QueueError::InvalidRequest {
        reason: format!("invalid url {raw:?}: {e}"),
    };
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => origin.join(raw).map_err(invalid)?,
        Err(e) => return Err(invalid(e)),
    };
    if url.origin() != origin.origin() {
        return Err(QueueError::OriginMismatch {
            expected: origin.origin().ascii_serialization(),
            actual: url.origin().ascii_serialization(),
        });
    }
    Ok(url)
}

/// Keeps a dispatched batch counted as in flight until it is released, even if the
/// dispatch unwinds or is cancelled part way.
struct InFlight<'a> {
    inner: &'a QueueInner,
    size: usize,
}

impl InFlight<'_> {
    fn release(&mut self, state: &mut QueueState) {
        state.in_flight = state.in_flight.saturating_sub(std::mem::take(&mut self.size));
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.size > 0 {
            let inner = self.inner;
            let mut state = inner.lock();
            self.release(&mut state);
        }
    }
}

/// Batching request queue bound to one origin.
///
/// Cheap to clone; clones share the pending buffer. Submitting spawns Tokio tasks, so the
/// queue must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("origin", &self.inner.origin.as_str())
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl RequestQueue {
    pub fn builder<T: Transport + 'static>(
        origin: impl Into<String>,
        transport: T,
    ) -> RequestQueueBuilder {
        RequestQueueBuilder {
            origin: origin.into(),
            transport: Arc::new(transport),
            config: BatchConfig::default(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            events: None,
        }
    }

    pub fn new<T: Transport + 'static>(
        origin: impl Into<String>,
        transport: T,
        config: BatchConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(origin, transport).config(config).build()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    /// Resolve `url` on the queue's origin, with the same rules as admission.
    pub(crate) fn resolve(&self, url: &str) -> Result<Url, QueueError> {
        self.inner.resolve(url)
    }

    /// Absolute URL batches are POSTed to.
    pub fn batch_url(&self) -> &Url {
        &self.inner.batch_url
    }

    /// Admit a request and return a handle to its eventual result.
    ///
    /// Admission errors (origin mismatch, bad JSON body, queue full) are returned
    /// immediately and the request is never queued.
    pub fn submit(&self, descriptor: RequestDescriptor) -> Result<PendingResponse, QueueError> {
        let inner = &self.inner;
        let target = inner.resolve(descriptor.url())?;
        let body = descriptor.payload_body()?;
        let (settle, rx) = oneshot::channel();
        let request = QueuedRequest {
            descriptor,
            target,
            body,
            settle,
            enqueued_at: inner.clock.now_millis(),
        };

        let ready = {
            let mut state = inner.lock();
            if let Some(capacity) = inner.config.max_pending() {
                if state.pending.len() + state.in_flight >= capacity {
                    tracing::warn!(capacity, "request queue full, rejecting request");
                    return Err(QueueError::QueueFull { capacity });
                }
            }
            state.pending.push_back(request);
            if state.pending.len() >= inner.config.max_batch_size() {
                state.cancel_timer();
                Some(state.take_batch(inner.config.max_batch_size()))
            } else {
                self.arm_timer(&mut state);
                None
            }
        };

        if let Some(batch) = ready {
            self.spawn_dispatch(batch);
        }
        Ok(PendingResponse { rx })
    }

    /// Submit and wait for the result.
    pub async fn enqueue(&self, descriptor: RequestDescriptor) -> Result<Value, QueueError> {
        self.submit(descriptor)?.await
    }

    /// Like [`enqueue`](Self::enqueue) but stop waiting after `timeout`.
    ///
    /// The request stays in its batch; only this caller gives up on it.
    pub async fn enqueue_with_timeout(
        &self,
        descriptor: RequestDescriptor,
        timeout: Duration,
    ) -> Result<Value, QueueError> {
        let pending = self.submit(descriptor)?;
        let deadline = self.inner.sleeper.sleep(timeout);
        tokio::select! {
            settled = pending => settled,
            _ = deadline => Err(QueueError::DeadlineExceeded { timeout }),
        }
    }

    /// Dispatch everything pending now, in batches of at most `max_batch_size`, and wait
    /// for those batches to settle.
    pub async fn flush(&self) {
        let batches = {
            let mut state = self.inner.lock();
            state.cancel_timer();
            let mut batches = Vec::new();
            while !state.pending.is_empty() {
                batches.push(state.take_batch(self.inner.config.max_batch_size()));
            }
            batches
        };
        if batches.is_empty() {
            return;
        }
        tracing::debug!(batches = batches.len(), "flushing request queue");
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let queue = self.clone();
                tokio::spawn(async move { queue.dispatch(batch).await })
            })
            .collect();
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "batch dispatch task failed");
            }
        }
    }

    /// Resubmit every descriptor in the failed buffer and clear it.
    ///
    /// Descriptors that cannot be readmitted (for example because the queue is full) go
    /// back into the buffer.
    pub fn retry_failed(&self) -> Vec<PendingResponse> {
        let failed = std::mem::take(&mut self.inner.lock().failed);
        if failed.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = failed.len(), "resubmitting failed requests");
        let mut handles = Vec::with_capacity(failed.len());
        for descriptor in failed {
            match self.submit(descriptor.clone()) {
                Ok(pending) => handles.push(pending),
                Err(e) => {
                    tracing::warn!(
                        method = descriptor.method(),
                        url = descriptor.url(),
                        error = %e,
                        "could not resubmit failed request"
                    );
                    self.inner.lock().failed.push(descriptor);
                }
            }
        }
        handles
    }

    /// Descriptors of requests whose batch failed, oldest first.
    pub fn failed_requests(&self) -> Vec<RequestDescriptor> {
        self.inner.lock().failed.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight,
            failed: state.failed.len(),
            oldest_enqueued_at: state.pending.front().map(|r| r.enqueued_at),
            timer_armed: state.scheduled.is_some(),
        }
    }

    fn arm_timer(&self, state: &mut QueueState) {
        if state.scheduled.is_some() {
            return;
        }
        let id = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        let sleep = self.inner.sleeper.sleep(self.inner.config.max_delay());
        let queue = self.clone();
        let handle = tokio::spawn(async move {
            sleep.await;
            queue.on_timer(id).await;
        });
        state.scheduled = Some(ScheduledFlush { id, handle: handle.abort_handle() });
    }

    async fn on_timer(&self, id: u64) {
        let batch = {
            let mut state = self.inner.lock();
            if state.scheduled.as_ref().map(|s| s.id) != Some(id) {
                return;
            }
            state.scheduled = None;
            if state.pending.is_empty() {
                return;
            }
            state.take_batch(self.inner.config.max_batch_size())
        };
        self.dispatch(batch).await;
    }

    fn spawn_dispatch(&self, batch: Vec<QueuedRequest>) {
        let queue = self.clone();
        tokio::spawn(async move { queue.dispatch(batch).await });
    }

    async fn dispatch(&self, batch: Vec<QueuedRequest>) {
        let inner: &QueueInner = &self.inner;
        let batch_id = format!("batch-{}", inner.next_batch.fetch_add(1, Ordering::Relaxed) + 1);
        let started = inner.clock.now_millis();
        let size = batch.len();
        let mut in_flight = InFlight { inner, size };
        let groups = group_batch(batch, inner.config.deduplicate());
        tracing::debug!(
            batch_id = %batch_id,
            requests = size,
            wire_items = groups.len(),
            "dispatching batch"
        );

        let outcome = match AssertUnwindSafe(self.send(&batch_id, &groups)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(batch_id = %batch_id, panic = %message, "transport panicked");
                Err(QueueError::Transport {
                    batch_id: batch_id.clone(),
                    source: Arc::new(TransportError::Other(
                        format!("transport panicked: {message}").into(),
                    )),
                })
            }
        };

        let (success_count, error_count) = match &outcome {
            Ok(results) => groups.iter().zip(results).fold((0, 0), |(ok, err), (group, result)| {
                match result {
                    Ok(_) => (ok + group.len(), err),
                    Err(_) => (ok, err + group.len()),
                }
            }),
            Err(_) => (0, size),
        };

        let queue_size_remaining = {
            let mut state = inner.lock();
            in_flight.release(&mut state);
            if outcome.is_err() {
                let descriptors = groups
                    .iter()
                    .flat_map(|g| std::iter::once(&g.primary).chain(&g.duplicates))
                    .map(|r| r.descriptor.clone());
                state.failed.extend(descriptors);
            }
            if !state.pending.is_empty() {
                self.arm_timer(&mut state);
            }
            state.pending.len()
        };

        let duration = Duration::from_millis(inner.clock.now_millis().saturating_sub(started));
        match &outcome {
            Ok(_) => tracing::debug!(
                batch_id = %batch_id,
                success_count,
                error_count,
                duration_ms = duration.as_millis() as u64,
                "batch settled"
            ),
            Err(e) => tracing::warn!(
                batch_id = %batch_id,
                requests = size,
                error = %e,
                "batch failed, requests moved to the failed buffer"
            ),
        }
        if let Some(bus) = &inner.events {
            bus.emit(&PolicyEvent::BatchProcessed(BatchMetrics {
                batch_id,
                duration,
                success_count,
                error_count,
                queue_size_remaining,
            }));
        }

        match outcome {
            Ok(results) => {
                for (group, result) in groups.into_iter().zip(results) {
                    let settled = result.map_err(|message| QueueError::Remote { message });
                    for member in group.members() {
                        let _ = member.settle.send(settled.clone());
                    }
                }
            }
            Err(error) => {
                for member in groups.into_iter().flat_map(WireGroup::members) {
                    let _ = member.settle.send(Err(error.clone()));
                }
            }
        }
    }

    async fn send(&self, batch_id: &str, groups: &[WireGroup]) -> Result<Vec<ItemResult>, QueueError> {
        let payload: Vec<BatchPayloadItem> = groups
            .iter()
            .enumerate()
            .map(|(i, group)| group.primary.payload_item(i + 1))
            .collect();
        let body = serde_json::to_vec(&payload).map_err(|e| QueueError::BatchProcessing {
            batch_id: batch_id.to_string(),
            reason: format!("could not encode batch payload: {e}"),
        })?;

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert(BATCH_MARKER_HEADER.to_string(), "true".to_string());
        let request = TransportRequest {
            method: "POST".to_string(),
            url: self.inner.batch_url.to_string(),
            headers,
            body: Some(body),
        };

        let response = self.inner.transport.send(request).await.map_err(|e| QueueError::Transport {
            batch_id: batch_id.to_string(),
            source: Arc::new(e),
        })?;
        if !response.is_success() {
            return Err(QueueError::HttpStatus {
                batch_id: batch_id.to_string(),
                status: response.status,
            });
        }

        let results = wire::decode_batch_response(&response.body, batch_id)?;
        if results.len() != groups.len() {
            return Err(QueueError::BatchProcessing {
                batch_id: batch_id.to_string(),
                reason: format!(
                    "response size mismatch: sent {} items, received {}",
                    groups.len(),
                    results.len()
                ),
            });
        }
        Ok(results)
    }
}

/// Builder for [`RequestQueue`].
pub struct RequestQueueBuilder {
    origin: String,
    transport: Arc<dyn Transport>,
    config: BatchConfig,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus<PolicyEvent>>,
}

impl RequestQueueBuilder {
    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Sleeper driving the `max_delay` timer.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Clock used for batch durations and admission timestamps.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn events(mut self, bus: EventBus<PolicyEvent>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn build(self) -> Result<RequestQueue, ConfigError> {
        let origin = parse_origin(&self.origin)?;
        let config = self.config;
        let batch_url = origin.join(config.batch_path()).map_err(|_| {
            ConfigError::InvalidBatchPath(config.batch_path().to_string())
        })?;

        Ok(RequestQueue {
            inner: Arc::new(QueueInner {
                config,
                origin,
                batch_url,
                transport: self.transport,
                sleeper: self.sleeper,
                clock: self.clock,
                events: self.events,
                state: Mutex::new(QueueState::default()),
                next_batch: AtomicU64::new(0),
                next_timer: AtomicU64::new(0),
            }),
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn parse_origin(origin: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidOrigin {
        origin: origin.to_string(),
        reason,
    };
    let url = Url::parse(origin).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        return Err(invalid("origin must not carry a path, query or fragment".to_string()));
    }
    Ok(url)
}
