//! API client: per-group circuit breakers in front of the batching queue.
//!
//! The client owns its [`CircuitBreakerRegistry`], its [`RequestQueue`] and the event bus
//! both of them publish on. Every call names a breaker group (for example `"cms"` or
//! `"forms"`); failures in one group never open another group's breaker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, QueueError, ResilienceError};
use crate::queue::{BatchConfig, RequestDescriptor, RequestQueue};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{BatchMetrics, EventBus, EventKind, ListenerId, PolicyEvent, StateChange};
use crate::transport::{Transport, TransportError, TransportRequest};

#[derive(Clone, Debug)]
pub struct ApiClient {
    registry: CircuitBreakerRegistry,
    queue: RequestQueue,
    transport: Arc<dyn Transport>,
    breaker_config: CircuitBreakerConfig,
    events: EventBus<PolicyEvent>,
    request_timeout: Option<Duration>,
}

impl ApiClient {
    pub fn builder<T: Transport + 'static>(origin: impl Into<String>, transport: T) -> ApiClientBuilder {
        ApiClientBuilder {
            origin: origin.into(),
            transport: Arc::new(transport),
            batch_config: BatchConfig::default(),
            breaker_config: CircuitBreakerConfig::default(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            events: EventBus::new(),
            request_timeout: None,
        }
    }

    /// Send `descriptor` through the batching queue, guarded by the breaker for `group`.
    pub async fn request(
        &self,
        group: &str,
        descriptor: RequestDescriptor,
    ) -> Result<Value, ResilienceError<QueueError>> {
        let breaker = self.breaker(group);
        breaker
            .execute(move || async move {
                match self.request_timeout {
                    Some(timeout) => self.queue.enqueue_with_timeout(descriptor, timeout).await,
                    None => self.queue.enqueue(descriptor).await,
                }
            })
            .await
    }

    /// Send `descriptor` straight to the transport, bypassing batching, guarded by the
    /// breaker for `group`. Non-success statuses count as failures.
    ///
    /// The URL must resolve to the client's origin; anything else is rejected before the
    /// breaker or the transport see it.
    pub async fn request_direct(
        &self,
        group: &str,
        descriptor: RequestDescriptor,
    ) -> Result<Value, ResilienceError<TransportError>> {
        let request = self.direct_request(&descriptor).map_err(ResilienceError::Inner)?;
        let breaker = self.breaker(group);
        breaker
            .execute(move || async move {
                let response = self.transport.send(request).await?;
                if !response.is_success() {
                    return Err(TransportError::Status(response.status));
                }
                if response.body.is_empty() {
                    return Ok(Value::Null);
                }
                response.parse_json().map_err(|e| TransportError::Other(Box::new(e)))
            })
            .await
    }

    /// Breaker for `group`, created with the client's breaker config on first use.
    pub fn breaker(&self, group: &str) -> CircuitBreaker {
        self.registry.get_or_create(group, self.breaker_config.clone())
    }

    pub fn registry(&self) -> &CircuitBreakerRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Bus carrying `batch-processed` and `state-change` events.
    pub fn events(&self) -> &EventBus<PolicyEvent> {
        &self.events
    }

    pub fn on_batch_processed<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&BatchMetrics) + Send + Sync + 'static,
    {
        self.events.on(EventKind::BatchProcessed, move |event| {
            if let PolicyEvent::BatchProcessed(metrics) = event {
                listener(metrics);
            }
        })
    }

    pub fn on_state_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.events.on(EventKind::StateChange, move |event| {
            if let PolicyEvent::StateChange(change) = event {
                listener(change);
            }
        })
    }

    fn direct_request(&self, descriptor: &RequestDescriptor) -> Result<TransportRequest, TransportError> {
        let url = self
            .queue
            .resolve(descriptor.url())
            .map_err(|e| TransportError::Other(Box::new(e)))?;
        let headers: BTreeMap<String, String> = descriptor.headers().clone();
        Ok(TransportRequest {
            method: descriptor.method().to_string(),
            url: url.to_string(),
            headers,
            body: descriptor.body_text().map(|b| b.as_bytes().to_vec()),
        })
    }
}

pub struct ApiClientBuilder {
    origin: String,
    transport: Arc<dyn Transport>,
    batch_config: BatchConfig,
    breaker_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    events: EventBus<PolicyEvent>,
    request_timeout: Option<Duration>,
}

impl ApiClientBuilder {
    pub fn batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = config;
        self
    }

    /// Config for every breaker the client creates.
    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Clock shared by the breakers and the queue.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Publish on an existing bus instead of a fresh one.
    pub fn events(mut self, bus: EventBus<PolicyEvent>) -> Self {
        self.events = bus;
        self
    }

    /// Give up waiting on batched requests after `timeout`; counts as a breaker failure.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<ApiClient, ConfigError> {
        let queue = RequestQueue::builder(self.origin, self.transport.clone())
            .config(self.batch_config)
            .sleeper(self.sleeper)
            .clock(self.clock.clone())
            .events(self.events.clone())
            .build()?;
        let registry = CircuitBreakerRegistry::new()
            .with_clock(self.clock)
            .with_events(self.events.clone());
        Ok(ApiClient {
            registry,
            queue,
            transport: self.transport,
            breaker_config: self.breaker_config,
            events: self.events,
            request_timeout: self.request_timeout,
        })
    }
}
