//! Run configuration for the producer/consumer pipeline.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`StreamPipeline`](crate::pipeline::StreamPipeline).
///
/// Immutable for the lifetime of a run. Validation is eager: building a
/// pipeline from an invalid config fails rather than silently clamping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of consumer worker threads.
    pub worker_threads: usize,
    /// Capacity of the bounded work queue between producer and consumers.
    pub queue_capacity: usize,
    /// Per-attempt deadline for the transform. `None` disables timeouts.
    pub per_task_timeout: Option<Duration>,
    /// Maximum retries per item after the first attempt. `0` means no retry.
    pub max_retries: u32,
    /// How long a single producer offer waits before re-checking for a stop
    /// request.
    pub producer_offer_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            worker_threads: workers,
            queue_capacity: (workers * 256).max(100),
            per_task_timeout: None,
            max_retries: 0,
            producer_offer_timeout: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Sets the work queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_per_task_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = Some(timeout);
        self
    }

    /// Sets the maximum number of retries per item.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the producer offer timeout.
    #[must_use]
    pub fn with_producer_offer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_offer_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.producer_offer_timeout.is_zero() {
            return Err(ConfigError::ZeroOfferTimeout);
        }
        Ok(())
    }
}
