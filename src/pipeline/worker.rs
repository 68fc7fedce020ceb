//! Consumer worker loop: timed polling, retry, and deadline hygiene.

use crate::cancellation::CancellationToken;
use crate::errors::{EngineError, SinkError, TaskError};
use crate::metrics::PipelineMetrics;
use crate::queue::BoundedQueue;
use crate::source::{ErrorSink, ItemTransform, ResultSink};
use crate::timeout::{InterruptFlag, TimeoutScheduler};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How long a worker waits on an empty queue before re-evaluating its
/// termination condition.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-run state shared between the producer and all consumers.
pub(crate) struct RunShared<'a, T> {
    pub queue: &'a BoundedQueue<T>,
    pub stop: &'a CancellationToken,
    pub producer_finished: &'a AtomicBool,
    pub metrics: &'a PipelineMetrics,
    pub scheduler: &'a TimeoutScheduler,
    pub per_task_timeout: Option<Duration>,
    pub max_retries: u32,
}

/// One consumer's main loop.
///
/// Polls with a timeout rather than blocking indefinitely so the
/// termination condition is re-evaluated periodically even when no new
/// items arrive.
pub(crate) fn consumer_loop<T, R, X, FR, FE>(
    index: usize,
    shared: &RunShared<'_, T>,
    transform: &X,
    on_result: &FR,
    on_error: &FE,
) where
    T: Send,
    X: ItemTransform<T, R>,
    FR: ResultSink<T, R>,
    FE: ErrorSink<T>,
{
    // Reused across every item this worker processes; cleared after each
    // attempt so a late deadline cannot leak into the next task.
    let interrupt = Arc::new(InterruptFlag::new());
    trace!(worker = index, "consumer started");

    loop {
        if shared.stop.is_cancelled()
            && shared.producer_finished.load(Ordering::SeqCst)
            && shared.queue.is_empty()
        {
            break;
        }

        let Some(item) = shared.queue.poll(POLL_INTERVAL) else {
            if shared.producer_finished.load(Ordering::SeqCst) && shared.queue.is_empty() {
                break;
            }
            continue;
        };

        process_item(index, shared, &interrupt, item, transform, on_result, on_error);
    }

    trace!(worker = index, "consumer exiting");
}

/// Runs the retry loop for one item on the current worker thread.
fn process_item<T, R, X, FR, FE>(
    index: usize,
    shared: &RunShared<'_, T>,
    interrupt: &Arc<InterruptFlag>,
    item: T,
    transform: &X,
    on_result: &FR,
    on_error: &FE,
) where
    T: Send,
    X: ItemTransform<T, R>,
    FR: ResultSink<T, R>,
    FE: ErrorSink<T>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        let deadline = shared
            .per_task_timeout
            .map(|timeout| shared.scheduler.schedule(timeout, Arc::clone(interrupt)));

        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| transform.apply(&item, interrupt)));

        if let Some(handle) = &deadline {
            handle.cancel();
        }
        let interrupted = interrupt.clear();

        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => Err(TaskError::from_panic(panic.as_ref())),
        };

        match outcome {
            Ok(result) => {
                // Completing after the deadline fired still counts as
                // success; only the residual signal is discarded.
                deliver_result(index, shared, &item, result, on_result, on_error);
                break;
            }
            Err(error) => {
                // A fired deadline explains a plain failure; a panic keeps
                // its own classification, and a raised flag without a
                // configured timeout never relabels.
                let error = match shared.per_task_timeout {
                    Some(timeout) if interrupted && matches!(error, TaskError::Failed(_)) => {
                        TaskError::timeout(timeout)
                    }
                    _ => error,
                };

                if attempts > shared.max_retries {
                    shared.metrics.record_failed();
                    warn!(worker = index, attempts, %error, "task failed terminally");
                    report_error(on_error, Some(&item), &EngineError::Task(error));
                    break;
                }

                debug!(worker = index, attempt = attempts, %error, "task attempt failed; retrying");
            }
        }
    }
}

fn deliver_result<T, R, FR, FE>(
    index: usize,
    shared: &RunShared<'_, T>,
    item: &T,
    result: R,
    on_result: &FR,
    on_error: &FE,
) where
    FR: ResultSink<T, R>,
    FE: ErrorSink<T>,
{
    let delivered =
        std::panic::catch_unwind(AssertUnwindSafe(|| on_result.on_result(item, result)));

    let sink_result = match delivered {
        Ok(result) => result,
        Err(panic) => Err(SinkError::from_panic(panic.as_ref())),
    };

    match sink_result {
        Ok(()) => shared.metrics.record_consumed(),
        Err(error) => {
            // Sink failures are terminal for the item and never retried.
            shared.metrics.record_failed();
            warn!(worker = index, %error, "result sink failed");
            report_error(on_error, Some(item), &EngineError::Sink(error));
        }
    }
}

/// Invokes the error sink, containing any panic it raises.
pub(crate) fn report_error<T, FE>(on_error: &FE, item: Option<&T>, error: &EngineError)
where
    FE: ErrorSink<T>,
{
    if std::panic::catch_unwind(AssertUnwindSafe(|| on_error.on_error(item, error))).is_err() {
        warn!("error sink panicked; failure already accounted");
    }
}
