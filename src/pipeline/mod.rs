//! Bounded-queue producer/consumer pipeline.
//!
//! One producer thread fills a fixed-capacity queue from an
//! [`ItemSource`]; a pool of consumer workers drains it, each running the
//! transform in place with optional deadline interruption and local retry.
//! The queue is the single point of shared mutable state between producer
//! and consumers, and its capacity bounds memory independently of worker
//! count.

mod worker;


use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{ConfigError, EngineError};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::queue::BoundedQueue;
use crate::source::{ErrorSink, ItemSource, ItemTransform, ResultSink};
use crate::timeout::TimeoutScheduler;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No run has started yet.
    Idle,
    /// The producer is pulling items and workers are processing.
    Running,
    /// The producer has finished; workers are draining the queue.
    Draining,
    /// The run finished and every produced item reached a terminal outcome.
    Completed,
    /// The source failed unrecoverably; already-queued items were still
    /// drained.
    Aborted,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Completed,
            4 => Self::Aborted,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn set(&self, state: RunState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Final accounting of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Terminal state, `Completed` or `Aborted`.
    pub state: RunState,
    /// Items placed into the work queue.
    pub produced: u64,
    /// Items processed to a successful terminal outcome.
    pub consumed: u64,
    /// Items that reached a failed terminal outcome.
    pub failed: u64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    /// Returns true if every produced item reached a terminal outcome.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.produced == self.consumed + self.failed
    }

    /// Converts the summary to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "state": self.state,
            "produced": self.produced,
            "consumed": self.consumed,
            "failed": self.failed,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
        })
    }
}

/// Handle to a detached pipeline run started by
/// [`StreamPipeline::run_async`].
#[derive(Debug)]
pub struct RunHandle {
    thread: std::thread::JoinHandle<Result<RunSummary, EngineError>>,
}

impl RunHandle {
    /// Blocks until the run finishes and returns its summary.
    pub fn join(self) -> Result<RunSummary, EngineError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(EngineError::Orchestration(
                "orchestration thread panicked".to_string(),
            )),
        }
    }

    /// Returns true once the run has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Producer/consumer processing engine with a fixed worker pool.
///
/// Runs on one pipeline instance may not overlap: a second run started
/// while the first is active fails fast with
/// [`EngineError::RunInProgress`]. The per-run counters are readable at
/// any time through [`metrics`](Self::metrics).
pub struct StreamPipeline {
    config: PipelineConfig,
    metrics: PipelineMetrics,
    scheduler: TimeoutScheduler,
    state: StateCell,
    current_stop: RwLock<Option<Arc<CancellationToken>>>,
    run_guard: Mutex<()>,
}

impl StreamPipeline {
    /// Creates a pipeline from a validated configuration.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: PipelineMetrics::new(),
            scheduler: TimeoutScheduler::new(),
            state: StateCell::new(RunState::Idle),
            current_stop: RwLock::new(None),
            run_guard: Mutex::new(()),
        })
    }

    /// Creates a pipeline with default configuration.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(PipelineConfig::default())
    }

    /// Returns the pipeline's configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns a point-in-time snapshot of the run counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Requests a cooperative stop of the active run, if any.
    ///
    /// The producer stops pulling promptly; items already queued are still
    /// drained before the run finishes.
    pub fn request_stop(&self, reason: impl Into<String>) {
        if let Some(stop) = self.current_stop.read().as_ref() {
            stop.cancel(reason);
        }
    }

    /// Processes the source to exhaustion, blocking until the run reaches
    /// `Completed` or `Aborted`.
    ///
    /// Every item outcome is delivered exactly once through `on_result` or
    /// `on_error`; the returned summary carries the final counters.
    pub fn run_sync<T, R, S, X, FR, FE>(
        &self,
        mut source: S,
        transform: &X,
        on_result: &FR,
        on_error: &FE,
    ) -> Result<RunSummary, EngineError>
    where
        T: Send,
        R: Send,
        S: ItemSource<T>,
        X: ItemTransform<T, R>,
        FR: ResultSink<T, R>,
        FE: ErrorSink<T>,
    {
        let _run = self.run_guard.try_lock().ok_or(EngineError::RunInProgress)?;

        let run_id = Uuid::new_v4();
        let span = info_span!(
            "pipeline_run",
            run_id = %run_id,
            workers = self.config.worker_threads,
        );
        let _enter = span.enter();

        let started_at = Utc::now();
        self.metrics.reset();
        self.state.set(RunState::Running);

        let stop = Arc::new(CancellationToken::new());
        *self.current_stop.write() = Some(Arc::clone(&stop));

        let queue = BoundedQueue::new(self.config.queue_capacity);
        let producer_finished = AtomicBool::new(false);
        let supply_failed = AtomicBool::new(false);

        info!(
            queue_capacity = self.config.queue_capacity,
            max_retries = self.config.max_retries,
            "starting pipeline run"
        );

        let shared = worker::RunShared {
            queue: &queue,
            stop: &stop,
            producer_finished: &producer_finished,
            metrics: &self.metrics,
            scheduler: &self.scheduler,
            per_task_timeout: self.config.per_task_timeout,
            max_retries: self.config.max_retries,
        };

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..self.config.worker_threads)
                .map(|index| {
                    let shared = &shared;
                    scope.spawn(move || {
                        worker::consumer_loop(index, shared, transform, on_result, on_error);
                    })
                })
                .collect();

            let producer = scope.spawn(|| {
                self.produce(
                    &mut source,
                    &queue,
                    &stop,
                    &producer_finished,
                    &supply_failed,
                    on_error,
                );
            });

            if producer.join().is_err() {
                error!("producer thread panicked");
                supply_failed.store(true, Ordering::SeqCst);
            }
            self.state.set(RunState::Draining);
            debug!("producer finished; draining queue");

            for handle in workers {
                if handle.join().is_err() {
                    error!("worker thread panicked");
                }
            }
        });

        *self.current_stop.write() = None;

        let final_state = if supply_failed.load(Ordering::SeqCst) {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.state.set(final_state);

        let snapshot = self.metrics.snapshot();
        let summary = RunSummary {
            run_id,
            state: final_state,
            produced: snapshot.produced,
            consumed: snapshot.consumed,
            failed: snapshot.failed,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            produced = summary.produced,
            consumed = summary.consumed,
            failed = summary.failed,
            state = ?summary.state,
            "pipeline run finished"
        );
        Ok(summary)
    }

    /// Starts a run on a detached orchestration thread.
    ///
    /// The run has the same contract as [`run_sync`](Self::run_sync);
    /// errors surface through [`RunHandle::join`].
    pub fn run_async<T, R, S, X, FR, FE>(
        self: &Arc<Self>,
        source: S,
        transform: X,
        on_result: FR,
        on_error: FE,
    ) -> Result<RunHandle, EngineError>
    where
        T: Send + 'static,
        R: Send + 'static,
        S: ItemSource<T> + 'static,
        X: ItemTransform<T, R> + Send + 'static,
        FR: ResultSink<T, R> + Send + 'static,
        FE: ErrorSink<T> + Send + 'static,
    {
        let pipeline = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("batchflow-orchestrator".to_string())
            .spawn(move || pipeline.run_sync(source, &transform, &on_result, &on_error))
            .map_err(|error| {
                EngineError::Orchestration(format!("failed to spawn orchestration thread: {error}"))
            })?;

        Ok(RunHandle { thread })
    }

    fn produce<T, S, FE>(
        &self,
        source: &mut S,
        queue: &BoundedQueue<T>,
        stop: &CancellationToken,
        finished: &AtomicBool,
        supply_failed: &AtomicBool,
        on_error: &FE,
    ) where
        T: Send,
        S: ItemSource<T>,
        FE: ErrorSink<T>,
    {
        // Must be marked finished on every exit path, panics included, or
        // the consumers' termination condition can never become true.
        let _guard = FinishGuard(finished);

        let Some(mut cursor) = source.cursor() else {
            debug!("item source yielded no cursor");
            return;
        };

        loop {
            if stop.is_cancelled() {
                debug!("stop requested; ending production");
                break;
            }

            match cursor.next() {
                None => {
                    debug!("item source exhausted");
                    break;
                }
                Some(Err(error)) => {
                    error!(%error, "item source failed; aborting production");
                    supply_failed.store(true, Ordering::SeqCst);
                    worker::report_error(on_error, None, &EngineError::Supply(error));
                    break;
                }
                Some(Ok(item)) => {
                    let unoffered = {
                        let mut current = item;
                        loop {
                            if stop.is_cancelled() {
                                break Some(current);
                            }
                            match queue.offer(current, self.config.producer_offer_timeout) {
                                Ok(()) => break None,
                                Err(back) => current = back,
                            }
                        }
                    };

                    match unoffered {
                        None => self.metrics.record_produced(),
                        Some(item) => {
                            warn!("stop requested with an item in hand; reporting it");
                            worker::report_error(
                                on_error,
                                Some(&item),
                                &EngineError::Interrupted(
                                    "stop requested before item could be enqueued".to_string(),
                                ),
                            );
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("config", &self.config)
            .field("state", &self.state.get())
            .finish()
    }
}

struct FinishGuard<'a>(&'a AtomicBool);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
