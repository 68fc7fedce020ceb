//! Caller-supplied contracts: data sources, transforms, and sinks.
//!
//! The engine pulls work through these seams and never assumes anything
//! about what the caller does inside them. Transform contracts may be
//! invoked more than once per item under retry; there is no exactly-once
//! guarantee across attempts.

use crate::errors::{EngineError, SinkError, SupplyError, TaskError};
use crate::timeout::InterruptFlag;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;

/// A pull-based source of immutable batches for the dispatcher.
///
/// An empty batch signals exhaustion. Errors propagate as [`SupplyError`]
/// and terminate further pulls without aborting in-flight work.
#[async_trait]
pub trait BatchSource<T>: Send {
    /// Pulls the next batch.
    async fn next_batch(&mut self) -> Result<Vec<T>, SupplyError>;
}

/// A [`BatchSource`] over a pre-built sequence of batches.
///
/// Yields the batches in order, then empty batches forever.
#[derive(Debug)]
pub struct VecBatchSource<T> {
    batches: VecDeque<Vec<T>>,
}

impl<T> VecBatchSource<T> {
    /// Creates a source over the given batches.
    #[must_use]
    pub fn new(batches: Vec<Vec<T>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

#[async_trait]
impl<T: Send> BatchSource<T> for VecBatchSource<T> {
    async fn next_batch(&mut self) -> Result<Vec<T>, SupplyError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

/// The dispatcher's per-item transformation.
#[async_trait]
pub trait TaskProcessor<T, R>: Send + Sync {
    /// Processes one work item into an outcome.
    async fn process(&self, item: &T) -> Result<R, TaskError>;
}

#[async_trait]
impl<T, R, P> TaskProcessor<T, R> for Arc<P>
where
    P: TaskProcessor<T, R> + ?Sized,
    T: Send + Sync,
    R: Send,
{
    async fn process(&self, item: &T) -> Result<R, TaskError> {
        (**self).process(item).await
    }
}

/// Adapts a synchronous closure into a [`TaskProcessor`].
#[derive(Debug)]
pub struct FnProcessor<F> {
    f: F,
}

impl<F> FnProcessor<F> {
    /// Wraps the given closure.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, R, F> TaskProcessor<T, R> for FnProcessor<F>
where
    T: Send + Sync,
    R: Send,
    F: Fn(&T) -> Result<R, TaskError> + Send + Sync,
{
    async fn process(&self, item: &T) -> Result<R, TaskError> {
        (self.f)(item)
    }
}

/// A pull-based item source for the pipeline.
///
/// Each run obtains a fresh cursor; `None` means there is nothing to
/// produce. An `Err` item is an unrecoverable source error that aborts
/// production.
pub trait ItemSource<T>: Send {
    /// Opens a cursor over the source's items.
    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = Result<T, SupplyError>> + Send + '_>>;
}

/// An [`ItemSource`] over any iterator. The cursor can be opened once.
#[derive(Debug)]
pub struct IterSource<I> {
    inner: Option<I>,
}

impl<I> IterSource<I> {
    /// Creates a single-use source over the given iterator.
    #[must_use]
    pub fn new(iter: I) -> Self {
        Self { inner: Some(iter) }
    }
}

impl<T, I> ItemSource<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send,
    T: 'static,
{
    fn cursor(&mut self) -> Option<Box<dyn Iterator<Item = Result<T, SupplyError>> + Send + '_>> {
        self.inner
            .take()
            .map(|iter| Box::new(iter.map(Ok)) as Box<dyn Iterator<Item = _> + Send>)
    }
}

/// The pipeline's per-item transformation, executed in place on a worker
/// thread.
///
/// `interrupt` is the worker's cooperative cancellation signal: the timeout
/// scheduler raises it when the attempt's deadline fires, and long-running
/// transforms should poll it and bail out early. Transforms that ignore it
/// still get their attempt classified as a timeout once they return.
pub trait ItemTransform<T, R>: Sync {
    /// Runs one transform attempt.
    fn apply(&self, item: &T, interrupt: &InterruptFlag) -> Result<R, TaskError>;
}

impl<T, R, F> ItemTransform<T, R> for F
where
    F: Fn(&T, &InterruptFlag) -> Result<R, TaskError> + Sync,
{
    fn apply(&self, item: &T, interrupt: &InterruptFlag) -> Result<R, TaskError> {
        self(item, interrupt)
    }
}

/// Receives each successful outcome exactly once.
///
/// A sink failure is terminal for the item: it is reported through the
/// error sink and never retried.
pub trait ResultSink<T, R>: Sync {
    /// Consumes one successful outcome.
    fn on_result(&self, item: &T, result: R) -> Result<(), SinkError>;
}

impl<T, R, F> ResultSink<T, R> for F
where
    F: Fn(&T, R) -> Result<(), SinkError> + Sync,
{
    fn on_result(&self, item: &T, result: R) -> Result<(), SinkError> {
        self(item, result)
    }
}

/// Receives each terminal failure exactly once.
///
/// `item` is `None` for source-level failures that are not tied to a single
/// work item. Panics inside the error sink are contained by the engine.
pub trait ErrorSink<T>: Sync {
    /// Reports one terminal failure.
    fn on_error(&self, item: Option<&T>, error: &EngineError);
}

impl<T, F> ErrorSink<T> for F
where
    F: Fn(Option<&T>, &EngineError) + Sync,
{
    fn on_error(&self, item: Option<&T>, error: &EngineError) {
        self(item, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_batch_source_exhausts_to_empty() {
        let mut source = VecBatchSource::new(vec![vec![1, 2], vec![3]]);

        assert_eq!(source.next_batch().await.unwrap(), vec![1, 2]);
        assert_eq!(source.next_batch().await.unwrap(), vec![3]);
        assert!(source.next_batch().await.unwrap().is_empty());
        assert!(source.next_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fn_processor() {
        let processor = FnProcessor::new(|item: &u32| Ok(item * 2));
        let result: Result<u32, TaskError> = processor.process(&21).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_iter_source_single_use() {
        let mut source = IterSource::new(1..=3u32);

        let cursor = source.cursor().expect("first cursor");
        let items: Vec<u32> = cursor.map(Result::unwrap).collect();
        assert_eq!(items, vec![1, 2, 3]);

        assert!(source.cursor().is_none());
    }
}
