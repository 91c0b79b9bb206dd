//! Per-step-run counters.

use crate::graph::WriteStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the stages of one step run.
#[derive(Debug, Default)]
pub struct StepCounters {
    extracted: AtomicU64,
    unique_inputs: AtomicU64,
    repeats_skipped: AtomicU64,
    rows_skipped: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    peak_memory_bytes: AtomicU64,
    total: AtomicU64,
}

impl StepCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one extracted row.
    pub fn record_extracted(&self) {
        self.extracted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one row skipped because it was already processed.
    pub fn record_repeat(&self) {
        self.repeats_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts processed inputs and rows skipped by a skip signal.
    pub fn record_batch(&self, processed: u64, skipped: u64) {
        self.unique_inputs.fetch_add(processed, Ordering::Relaxed);
        self.rows_skipped.fetch_add(skipped, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds write counts from a flush.
    pub fn record_write(&self, stats: WriteStats) {
        self.inserted.fetch_add(stats.inserted, Ordering::Relaxed);
        self.updated.fetch_add(stats.updated, Ordering::Relaxed);
        self.dropped.fetch_add(stats.dropped, Ordering::Relaxed);
    }

    /// Raises the peak memory to `bytes` if higher.
    pub fn record_memory(&self, bytes: u64) {
        self.peak_memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Sets the known number of rows the extract will yield.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Returns the number of inputs already handled, for progress output.
    #[must_use]
    pub fn progress(&self) -> (u64, Option<u64>) {
        let done = self.unique_inputs.load(Ordering::Relaxed)
            + self.repeats_skipped.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        (done, (total > 0).then_some(total))
    }

    /// Takes a consistent-enough copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StepStats {
        StepStats {
            extracted: self.extracted.load(Ordering::Relaxed),
            unique_inputs: self.unique_inputs.load(Ordering::Relaxed),
            repeats_skipped: self.repeats_skipped.load(Ordering::Relaxed),
            rows_skipped: self.rows_skipped.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            peak_memory_bytes: self.peak_memory_bytes.load(Ordering::Relaxed),
            runtime_ms: 0.0,
        }
    }
}

/// Counters of a finished or running step run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    /// Rows pulled from the extract.
    pub extracted: u64,
    /// Inputs processed this run (not repeats).
    pub unique_inputs: u64,
    /// Inputs skipped because they were already processed.
    pub repeats_skipped: u64,
    /// Inputs a transform skipped.
    pub rows_skipped: u64,
    /// Rows inserted into target tables.
    pub inserted: u64,
    /// Rows updated in target tables.
    pub updated: u64,
    /// Rows dropped by the foreign-key fallback.
    pub dropped: u64,
    /// Batches processed.
    pub batches: u64,
    /// Highest sampled resident memory.
    pub peak_memory_bytes: u64,
    /// Wall time of the step run.
    pub runtime_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let counters = StepCounters::new();
        counters.record_extracted();
        counters.record_extracted();
        counters.record_repeat();
        counters.record_batch(1, 0);
        counters.record_write(WriteStats {
            inserted: 3,
            updated: 1,
            dropped: 0,
        });
        counters.record_memory(100);
        counters.record_memory(50);

        let stats = counters.snapshot();
        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.repeats_skipped, 1);
        assert_eq!(stats.unique_inputs, 1);
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.peak_memory_bytes, 100);
    }

    #[test]
    fn test_progress() {
        let counters = StepCounters::new();
        assert_eq!(counters.progress(), (0, None));
        counters.set_total(10);
        counters.record_repeat();
        counters.record_batch(4, 1);
        assert_eq!(counters.progress(), (5, Some(10)));
    }
}
