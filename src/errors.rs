//! Error types for the batchflow engine.
//!
//! Every failure mode is caught at the boundary of the unit that raised it
//! and converted into a recorded failure plus an optional caller callback;
//! nothing propagates out of a run except through its completion handle.

use std::any::Any;
use std::time::Duration;
use thiserror::Error;

/// Errors raised during configuration validation.
///
/// Validation is eager: invalid values are rejected at construction rather
/// than clamped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A concurrency level of zero was supplied to the dispatcher.
    #[error("concurrency_level must be at least 1")]
    ZeroConcurrency,

    /// A worker thread count of zero was supplied to the pipeline.
    #[error("worker_threads must be at least 1")]
    ZeroWorkers,

    /// A queue capacity of zero was supplied to the pipeline.
    #[error("queue_capacity must be at least 1")]
    ZeroCapacity,

    /// The producer offer timeout was zero.
    #[error("producer_offer_timeout must be non-zero")]
    ZeroOfferTimeout,
}

/// A data-source failure.
///
/// Fatal to further pulls from the source, but never to work already in
/// flight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SupplyError {
    /// Description of what went wrong while pulling data.
    pub message: String,
}

impl SupplyError {
    /// Creates a new supply error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A failure of a single transform attempt.
///
/// Task errors are retryable: the same item may be attempted again up to the
/// configured retry limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The transform returned an error.
    #[error("task failed: {0}")]
    Failed(String),

    /// The attempt exceeded its deadline and was interrupted.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The transform panicked; the panic was contained and recorded.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Creates a plain task failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Creates a timeout failure for the given deadline.
    #[must_use]
    pub fn timeout(deadline: Duration) -> Self {
        Self::Timeout(deadline)
    }

    /// Builds a `Panicked` error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked(panic_message(payload))
    }

    /// Returns true if this error was induced by a deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A failure raised by a caller-supplied result sink.
///
/// Sink failures are terminal for the item: reported once, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("result sink failed: {message}")]
pub struct SinkError {
    /// Description of the sink failure.
    pub message: String,
}

impl SinkError {
    /// Creates a new sink error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Builds a sink error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(format!("sink panicked: {}", panic_message(payload)))
    }
}

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// The top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration was rejected at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The data source failed while being pulled.
    #[error("source failure: {0}")]
    Supply(#[from] SupplyError),

    /// A transform attempt failed terminally.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A result sink failed while consuming an outcome.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Submission of an item was cut short by a stop request.
    #[error("submission interrupted: {0}")]
    Interrupted(String),

    /// A pipeline run was started while another run was still active.
    #[error("another run is already in progress")]
    RunInProgress,

    /// The detached orchestration thread failed.
    #[error("orchestration failed: {0}")]
    Orchestration(String),
}
