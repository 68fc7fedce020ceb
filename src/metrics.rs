//! Progress counters for pipeline runs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic produced/consumed/failed counters for one pipeline.
///
/// Counters are reset at the start of each run and readable at any time,
/// including mid-run, for progress observability. Once a run reaches
/// `Completed`, `produced == consumed + failed`.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Items placed into the work queue.
    produced: AtomicU64,
    /// Items processed to a successful terminal outcome.
    consumed: AtomicU64,
    /// Items that reached a failed terminal outcome.
    failed: AtomicU64,
}

impl PipelineMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.produced.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    /// Records one item placed into the queue.
    pub fn record_produced(&self) {
        self.produced.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one successful terminal outcome.
    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one failed terminal outcome.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of produced items.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Returns the number of consumed items.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    /// Returns the number of failed items.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Takes a point-in-time snapshot of all three counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            produced: self.produced(),
            consumed: self.consumed(),
            failed: self.failed(),
        }
    }
}

/// A point-in-time view of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Items placed into the work queue.
    pub produced: u64,
    /// Items processed to a successful terminal outcome.
    pub consumed: u64,
    /// Items that reached a failed terminal outcome.
    pub failed: u64,
}

impl MetricsSnapshot {
    /// Converts the snapshot to a dictionary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "produced": self.produced,
            "consumed": self.consumed,
            "failed": self.failed,
        })
    }
}
