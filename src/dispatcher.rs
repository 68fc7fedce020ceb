//! Permit-gated streaming dispatcher.
//!
//! Pulls batches from a [`BatchSource`], gates submission through a counting
//! semaphore, runs each item on the async executor, and aggregates outcomes
//! into a [`BatchProcessResult`]. Backpressure is enforced purely by permit
//! acquisition blocking the single pulling task; there is no staging buffer.

use crate::cancellation::CancellationToken;
use crate::errors::{ConfigError, TaskError};
use crate::report::{BatchProcessResult, BatchResultBuilder};
use crate::source::{BatchSource, TaskProcessor};
use futures::FutureExt;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Streams batches of work through a bounded pool of concurrent tasks.
///
/// Each call to [`run`](Self::run) allocates a fresh result aggregate, so a
/// dispatcher is safe for concurrent independent runs. One item's failure
/// never aborts others, and a run always returns a full accounting of every
/// submitted item.
#[derive(Debug, Clone)]
pub struct BatchDispatcher {
    concurrency_level: usize,
}

impl BatchDispatcher {
    /// Creates a dispatcher bounded to `concurrency_level` in-flight tasks.
    ///
    /// A level of zero is rejected rather than clamped.
    pub fn new(concurrency_level: usize) -> Result<Self, ConfigError> {
        if concurrency_level == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self { concurrency_level })
    }

    /// Returns the configured concurrency bound.
    #[must_use]
    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    /// Processes the source to exhaustion and returns the frozen result.
    pub async fn run<T, R, S, P>(&self, source: &mut S, processor: P) -> BatchProcessResult<T, R>
    where
        T: Eq + Hash + Debug + Send + Sync + 'static,
        R: Send + 'static,
        S: BatchSource<T>,
        P: TaskProcessor<T, R> + 'static,
    {
        self.run_with_token(source, processor, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but polls `token` before each submission.
    ///
    /// Cancellation stops further submission; work already in flight is
    /// still drained and accounted for before the result is returned.
    pub async fn run_with_token<T, R, S, P>(
        &self,
        source: &mut S,
        processor: P,
        token: &CancellationToken,
    ) -> BatchProcessResult<T, R>
    where
        T: Eq + Hash + Debug + Send + Sync + 'static,
        R: Send + 'static,
        S: BatchSource<T>,
        P: TaskProcessor<T, R> + 'static,
    {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "dispatcher_run",
            run_id = %run_id,
            concurrency = self.concurrency_level,
        );
        self.run_inner(source, processor, token).instrument(span).await
    }

    async fn run_inner<T, R, S, P>(
        &self,
        source: &mut S,
        processor: P,
        token: &CancellationToken,
    ) -> BatchProcessResult<T, R>
    where
        T: Eq + Hash + Debug + Send + Sync + 'static,
        R: Send + 'static,
        S: BatchSource<T>,
        P: TaskProcessor<T, R> + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_level));
        let builder = Arc::new(BatchResultBuilder::new());
        let processor = Arc::new(processor);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        info!("starting streaming batch run");

        'pull: loop {
            let batch = match source.next_batch().await {
                Ok(batch) => batch,
                Err(error) => {
                    error!(%error, "batch source failed; terminating submission");
                    break;
                }
            };

            if batch.is_empty() {
                debug!("batch source exhausted");
                break;
            }

            debug!(batch_size = batch.len(), "pulled batch");

            for item in batch {
                if token.is_cancelled() {
                    warn!(
                        reason = token.reason().as_deref().unwrap_or("unspecified"),
                        "cancellation requested; stopping submission"
                    );
                    break 'pull;
                }

                // Backpressure: the pulling task blocks here until a permit
                // frees up, so submission can never outrun the bound.
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    warn!("permit pool closed; stopping submission");
                    break 'pull;
                };

                let processor = Arc::clone(&processor);
                let builder = Arc::clone(&builder);
                handles.push(tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(processor.process(&item))
                        .catch_unwind()
                        .await;

                    // Bookkeeping must complete before the permit is
                    // returned, so a subsequent submission cannot race it.
                    match outcome {
                        Ok(Ok(result)) => builder.add_success(result),
                        Ok(Err(error)) => {
                            warn!(item = ?item, %error, "task failed");
                            builder.add_failure(item, error);
                        }
                        Err(panic) => {
                            let error = TaskError::from_panic(panic.as_ref());
                            warn!(item = ?item, %error, "task panicked");
                            builder.add_failure(item, error);
                        }
                    }
                    drop(permit);
                }));
            }
        }

        debug!(submitted = handles.len(), "waiting for in-flight tasks");
        for handle in handles {
            if let Err(error) = handle.await {
                error!(%error, "task join failed");
            }
        }

        // Every handle has been awaited, so no task still holds a clone.
        let result = Arc::into_inner(builder)
            .expect("result builder unshared once all tasks are joined")
            .build();

        info!(
            total = result.total_tasks,
            successful = result.successful_tasks,
            failed = result.failed_tasks,
            "batch run finished"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SupplyError;
    use crate::source::{FnProcessor, VecBatchSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_zero_concurrency_rejected() {
        assert_eq!(
            BatchDispatcher::new(0).err(),
            Some(ConfigError::ZeroConcurrency)
        );
        assert_eq!(BatchDispatcher::new(2).unwrap().concurrency_level(), 2);
    }

    #[tokio::test]
    async fn test_two_batches_identity_transform() {
        let dispatcher = BatchDispatcher::new(2).unwrap();
        let mut source = VecBatchSource::new(vec![(0..5).collect(), (5..10).collect()]);

        let result = dispatcher
            .run(&mut source, FnProcessor::new(|item: &u32| Ok(*item)))
            .await;

        assert_eq!(result.total_tasks, 10);
        assert_eq!(result.successful_tasks, 10);
        assert_eq!(result.failed_tasks, 0);
        assert!(result.is_complete_success());

        let mut outcomes = result.success_results.clone();
        outcomes.sort_unstable();
        assert_eq!(outcomes, (0..10).collect::<Vec<u32>>());
    }

    struct InstrumentedProcessor {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl TaskProcessor<u32, u32> for InstrumentedProcessor {
        async fn process(&self, item: &u32) -> Result<u32, TaskError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(*item)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_bound() {
        let dispatcher = BatchDispatcher::new(3).unwrap();
        let mut source = VecBatchSource::new(vec![(0..20).collect(), (20..40).collect()]);
        let processor = Arc::new(InstrumentedProcessor {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let result = dispatcher.run(&mut source, Arc::clone(&processor)).await;

        assert_eq!(result.total_tasks, 40);
        assert!(processor.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_failures_are_recorded_not_fatal() {
        let dispatcher = BatchDispatcher::new(4).unwrap();
        let mut source = VecBatchSource::new(vec![(1..=20).collect()]);

        let result = dispatcher
            .run(
                &mut source,
                FnProcessor::new(|item: &u32| {
                    if item % 10 == 0 {
                        Err(TaskError::failed(format!("item {item} rejected")))
                    } else {
                        Ok(*item)
                    }
                }),
            )
            .await;

        assert_eq!(result.total_tasks, 20);
        assert_eq!(result.successful_tasks, 18);
        assert_eq!(result.failed_tasks, 2);
        assert!(result.failed_items.contains_key(&10));
        assert!(result.failed_items.contains_key(&20));
    }

    struct FlakySource {
        pulls: usize,
    }

    #[async_trait]
    impl BatchSource<u32> for FlakySource {
        async fn next_batch(&mut self) -> Result<Vec<u32>, SupplyError> {
            self.pulls += 1;
            match self.pulls {
                1 => Ok(vec![1, 2, 3]),
                _ => Err(SupplyError::new("upstream connection lost")),
            }
        }
    }

    #[tokio::test]
    async fn test_supply_error_keeps_in_flight_results() {
        let dispatcher = BatchDispatcher::new(2).unwrap();
        let mut source = FlakySource { pulls: 0 };

        let result = dispatcher
            .run(&mut source, FnProcessor::new(|item: &u32| Ok(item * 2)))
            .await;

        // The first batch was already submitted and is fully accounted for.
        assert_eq!(result.total_tasks, 3);
        assert_eq!(result.successful_tasks, 3);
    }

    struct SlowDoubler;

    #[async_trait]
    impl TaskProcessor<u32, u32> for SlowDoubler {
        async fn process(&self, item: &u32) -> Result<u32, TaskError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(item * 2)
        }
    }

    struct CancellingSource {
        pulls: usize,
        token: Arc<CancellationToken>,
    }

    #[async_trait]
    impl BatchSource<u32> for CancellingSource {
        async fn next_batch(&mut self) -> Result<Vec<u32>, SupplyError> {
            self.pulls += 1;
            if self.pulls == 1 {
                Ok(vec![1, 2, 3])
            } else {
                self.token.cancel("operator stop");
                Ok(vec![4, 5, 6])
            }
        }
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream_drains_in_flight_work() {
        let dispatcher = BatchDispatcher::new(2).unwrap();
        let token = Arc::new(CancellationToken::new());
        let mut source = CancellingSource {
            pulls: 0,
            token: Arc::clone(&token),
        };

        let result = dispatcher
            .run_with_token(&mut source, SlowDoubler, &token)
            .await;

        // The first batch was submitted before the stop and is fully
        // accounted; the second batch never entered the pool.
        assert_eq!(result.total_tasks, 3);
        assert_eq!(result.successful_tasks, 3);
        assert_eq!(result.failed_tasks, 0);

        let mut outcomes = result.success_results.clone();
        outcomes.sort_unstable();
        assert_eq!(outcomes, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_submission() {
        let dispatcher = BatchDispatcher::new(2).unwrap();
        let mut source = VecBatchSource::new(vec![vec![1u32, 2, 3]]);
        let token = CancellationToken::new();
        token.cancel("shutting down");

        let result = dispatcher
            .run_with_token(&mut source, FnProcessor::new(|item: &u32| Ok(*item)), &token)
            .await;

        assert_eq!(result.total_tasks, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_recorded_as_failure() {
        let dispatcher = BatchDispatcher::new(2).unwrap();
        let mut source = VecBatchSource::new(vec![vec![1u32, 2, 3]]);

        let result = dispatcher
            .run(
                &mut source,
                FnProcessor::new(|item: &u32| {
                    assert!(*item != 2, "cannot process item 2");
                    Ok(*item)
                }),
            )
            .await;

        assert_eq!(result.total_tasks, 3);
        assert_eq!(result.successful_tasks, 2);
        assert_eq!(result.failed_tasks, 1);
        assert!(matches!(
            result.failed_items.get(&2),
            Some(TaskError::Panicked(_))
        ));
    }
}
