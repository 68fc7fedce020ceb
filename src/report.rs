//! Result aggregation for dispatcher runs.

use crate::errors::TaskError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Immutable summary of one dispatcher run.
///
/// Invariant: `total_tasks == successful_tasks + failed_tasks ==
/// success_results.len() + failed_items.len()`.
#[derive(Debug)]
pub struct BatchProcessResult<T, R> {
    /// Total number of items that reached a terminal outcome.
    pub total_tasks: u64,
    /// Number of items processed successfully.
    pub successful_tasks: u64,
    /// Number of items that failed.
    pub failed_tasks: u64,
    /// Outcomes of successful items, in completion order.
    pub success_results: Vec<R>,
    /// Failed items keyed by the original work item.
    pub failed_items: HashMap<T, TaskError>,
}

impl<T, R> Default for BatchProcessResult<T, R> {
    fn default() -> Self {
        Self {
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            success_results: Vec::new(),
            failed_items: HashMap::new(),
        }
    }
}

impl<T, R> BatchProcessResult<T, R> {
    /// Returns true if every item succeeded.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.failed_tasks == 0
    }
}

/// Concurrent staging area that freezes into a [`BatchProcessResult`].
///
/// Safe for arbitrary concurrent `add_success`/`add_failure` calls from
/// completion callbacks. Successes are append-only; failures upsert by item
/// key, last write wins. `build` consumes the builder and must only be
/// called after all writers have been joined.
#[derive(Debug, Default)]
pub struct BatchResultBuilder<T: Eq + Hash, R> {
    successes: Mutex<Vec<R>>,
    failures: DashMap<T, TaskError>,
}

impl<T, R> BatchResultBuilder<T, R>
where
    T: Eq + Hash,
{
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            successes: Mutex::new(Vec::new()),
            failures: DashMap::new(),
        }
    }

    /// Appends a successful outcome.
    pub fn add_success(&self, result: R) {
        self.successes.lock().push(result);
    }

    /// Records a failed item, replacing any earlier failure for the same key.
    pub fn add_failure(&self, item: T, error: TaskError) {
        self.failures.insert(item, error);
    }

    /// Freezes the staged outcomes into an immutable result.
    #[must_use]
    pub fn build(self) -> BatchProcessResult<T, R> {
        let success_results = self.successes.into_inner();
        let failed_items: HashMap<T, TaskError> = self.failures.into_iter().collect();

        let successful = success_results.len() as u64;
        let failed = failed_items.len() as u64;

        BatchProcessResult {
            total_tasks: successful + failed,
            successful_tasks: successful,
            failed_tasks: failed,
            success_results,
            failed_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_builder_builds_empty_result() {
        let builder: BatchResultBuilder<String, u32> = BatchResultBuilder::new();
        let result = builder.build();

        assert_eq!(result.total_tasks, 0);
        assert!(result.is_complete_success());
    }

    #[test]
    fn test_result_invariant() {
        let builder = BatchResultBuilder::new();
        builder.add_success(10);
        builder.add_success(20);
        builder.add_failure("bad", TaskError::failed("boom"));

        let result = builder.build();
        assert_eq!(result.total_tasks, 3);
        assert_eq!(result.successful_tasks, 2);
        assert_eq!(result.failed_tasks, 1);
        assert_eq!(
            result.total_tasks,
            result.success_results.len() as u64 + result.failed_items.len() as u64
        );
    }

    #[test]
    fn test_failure_upsert_last_write_wins() {
        let builder: BatchResultBuilder<&str, u32> = BatchResultBuilder::new();
        builder.add_failure("item", TaskError::failed("first"));
        builder.add_failure("item", TaskError::failed("second"));

        let result = builder.build();
        assert_eq!(result.failed_tasks, 1);
        assert_eq!(
            result.failed_items.get("item"),
            Some(&TaskError::failed("second"))
        );
    }

    #[test]
    fn test_concurrent_writers() {
        let builder: Arc<BatchResultBuilder<u64, u64>> = Arc::new(BatchResultBuilder::new());

        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let builder = Arc::clone(&builder);
                scope.spawn(move || {
                    for i in 0..250u64 {
                        let id = t * 250 + i;
                        if id % 10 == 0 {
                            builder.add_failure(id, TaskError::failed("boom"));
                        } else {
                            builder.add_success(id);
                        }
                    }
                });
            }
        });

        let builder = Arc::into_inner(builder).expect("all writers joined");
        let result = builder.build();
        assert_eq!(result.total_tasks, 1000);
        assert_eq!(result.successful_tasks, 900);
        assert_eq!(result.failed_tasks, 100);
    }
}
