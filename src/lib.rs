//! # Batchflow
//!
//! A bounded-concurrency work processing engine with two execution models:
//!
//! - **Async dispatcher**: pulls immutable batches from a source and fans
//!   items out to an async processor under a semaphore-enforced concurrency
//!   cap, aggregating every outcome into a final report
//! - **Streaming pipeline**: a producer thread feeds a fixed-capacity queue
//!   drained by a pool of worker threads, with per-task deadlines,
//!   cooperative interruption, local retry, and exactly-once outcome
//!   delivery through caller-supplied sinks
//!
//! Both models contain panics at the task boundary, honor cooperative stop
//! requests, and guarantee that every admitted item reaches exactly one
//! terminal outcome.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use batchflow::prelude::*;
//!
//! let pipeline = StreamPipeline::with_defaults()?;
//! let summary = pipeline.run_sync(
//!     IterSource::new(1..=100u32),
//!     &|item: &u32, _: &InterruptFlag| Ok(item * 2),
//!     &|_item: &u32, _result: u32| Ok(()),
//!     &|_item: Option<&u32>, _error: &EngineError| {},
//! )?;
//! assert!(summary.is_conserved());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod observability;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod source;
pub mod timeout;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::PipelineConfig;
    pub use crate::dispatcher::BatchDispatcher;
    pub use crate::errors::{
        ConfigError, EngineError, SinkError, SupplyError, TaskError,
    };
    pub use crate::metrics::{MetricsSnapshot, PipelineMetrics};
    pub use crate::pipeline::{RunHandle, RunState, RunSummary, StreamPipeline};
    pub use crate::report::{BatchProcessResult, BatchResultBuilder};
    pub use crate::source::{
        BatchSource, ErrorSink, FnProcessor, IterSource, ItemSource, ItemTransform,
        ResultSink, TaskProcessor, VecBatchSource,
    };
    pub use crate::timeout::InterruptFlag;
}
