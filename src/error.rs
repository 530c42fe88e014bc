//! Error types for breakers, the request queue and configuration.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::transport::TransportError;

/// Error returned by a breaker-guarded operation.
///
/// `CircuitOpen` is the fail-fast signal: the wrapped operation was not invoked and the
/// rejection is not counted as a failure. Everything else is the operation's own error,
/// passed through unchanged in `Inner`.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker for `key` is open (or its half-open probe slots are taken).
    CircuitOpen {
        key: String,
        failure_count: usize,
        /// Time since the breaker opened.
        open_duration: Duration,
        /// Cooldown left before a probe is allowed; zero while half-open.
        retry_after: Duration,
    },
    /// The underlying operation failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { key, failure_count, open_duration, .. } => write!(
                f,
                "circuit breaker '{}' open ({} failures, open for {:?})",
                key, failure_count, open_duration
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is the breaker's fail-fast rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access `(open_duration, retry_after)` for a circuit-open rejection.
    pub fn circuit_open_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::CircuitOpen { open_duration, retry_after, .. } => {
                Some((*open_duration, *retry_after))
            }
            _ => None,
        }
    }
}

/// Errors surfaced by [`RequestQueue`](crate::queue::RequestQueue) callers.
///
/// Batch-level variants carry the batch id and are delivered, as clones of the same value,
/// to every caller that took part in the failed batch.
#[derive(thiserror::Error, Debug, Clone)]
pub enum QueueError {
    /// The request could not be admitted (bad URL, unparsable JSON body, ...).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    /// The request targets a different origin than the queue serves.
    #[error("request origin {actual} does not match queue origin {expected}")]
    OriginMismatch { expected: String, actual: String },
    /// Bounded admission rejected the request.
    #[error("request queue is full ({capacity} pending or in flight)")]
    QueueFull { capacity: usize },
    /// The batch call itself failed.
    #[error("batch {batch_id} failed: {source}")]
    Transport {
        batch_id: String,
        #[source]
        source: Arc<TransportError>,
    },
    /// The batch endpoint answered with a non-success status.
    #[error("batch {batch_id} failed with HTTP status {status}")]
    HttpStatus { batch_id: String, status: u16 },
    /// The batch response was malformed.
    ///
    /// `batch_id` is the id of the batch that failed (`batch-1`, `batch-2`, ... per queue),
    /// never a fixed literal such as `"batch"`, so match on the variant rather than the id.
    #[error("batch {batch_id} returned an invalid response: {reason}")]
    BatchProcessing { batch_id: String, reason: String },
    /// The batch succeeded but this request's item carried an error.
    #[error("{message}")]
    Remote { message: String },
    /// The caller stopped waiting; the request may still be delivered with its batch.
    #[error("no response within {timeout:?}")]
    DeadlineExceeded { timeout: Duration },
    /// The queue went away before settling the request.
    #[error("request abandoned before its batch settled")]
    Abandoned,
}

impl QueueError {
    /// Batch id for batch-level failures.
    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::Transport { batch_id, .. }
            | Self::HttpStatus { batch_id, .. }
            | Self::BatchProcessing { batch_id, .. } => Some(batch_id),
            _ => None,
        }
    }

    /// True when the whole batch failed, as opposed to this request alone.
    pub fn is_batch_failure(&self) -> bool {
        self.batch_id().is_some()
    }

    pub fn is_batch_processing(&self) -> bool {
        matches!(self, Self::BatchProcessing { .. })
    }
}

/// Configuration validation errors.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("half_open_limit must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
    #[error("reset_timeout must be > 0 unless the breaker is disabled (got {0:?})")]
    InvalidResetTimeout(Duration),
    #[error("failure_window must be > 0 (got {0:?})")]
    InvalidFailureWindow(Duration),
    #[error("max_batch_size must be > 0 (got {provided})")]
    InvalidBatchSize { provided: usize },
    #[error("max_pending must be > 0 when set")]
    InvalidMaxPending,
    #[error("batch path must start with '/' (got {0:?})")]
    InvalidBatchPath(String),
    #[error("invalid origin {origin:?}: {reason}")]
    InvalidOrigin { origin: String, reason: String },
}
