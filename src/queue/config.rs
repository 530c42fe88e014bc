use std::time::Duration;

use crate::error::ConfigError;

/// Batching policy for a [`RequestQueue`](super::RequestQueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    max_batch_size: usize,
    max_delay: Duration,
    deduplicate: bool,
    max_pending: Option<usize>,
    batch_path: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            max_delay: Duration::from_millis(50),
            deduplicate: true,
            max_pending: None,
            batch_path: "/api/batch".to_string(),
        }
    }
}

impl BatchConfig {
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder { config: Self::default() }
    }

    /// Requests per network call; reaching it flushes immediately.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Longest a request waits for companions before its batch is sent.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn deduplicate(&self) -> bool {
        self.deduplicate
    }

    /// Admission cap on `pending + in_flight`; `None` means unbounded.
    pub fn max_pending(&self) -> Option<usize> {
        self.max_pending
    }

    /// Path of the batch endpoint on the queue's origin.
    pub fn batch_path(&self) -> &str {
        &self.batch_path
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize { provided: 0 });
        }
        if self.max_pending == Some(0) {
            return Err(ConfigError::InvalidMaxPending);
        }
        if !self.batch_path.starts_with('/') || self.batch_path.starts_with("//") {
            return Err(ConfigError::InvalidBatchPath(self.batch_path.clone()));
        }
        Ok(())
    }
}

/// Builder for [`BatchConfig`].
#[derive(Debug, Clone)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn deduplicate(mut self, enabled: bool) -> Self {
        self.config.deduplicate = enabled;
        self
    }

    pub fn max_pending(mut self, cap: usize) -> Self {
        self.config.max_pending = Some(cap);
        self
    }

    pub fn batch_path(mut self, path: impl Into<String>) -> Self {
        self.config.batch_path = path.into();
        self
    }

    pub fn build(self) -> Result<BatchConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
