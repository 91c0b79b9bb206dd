//! Run summaries.

use super::FailureRecord;
use crate::core::{RunStatus, StepRunStatus};
use crate::pipeline::StepStats;
use crate::store::StepRunEntity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one step in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name.
    pub name: String,
    /// Position in execution order.
    pub ordering: Option<i32>,
    /// Terminal status.
    pub status: StepRunStatus,
    /// Counters.
    pub stats: StepStats,
    /// Error message of a failed step.
    pub error: Option<String>,
    /// Why the step did not run, for excluded and upstream-failed steps.
    pub reason: Option<String>,
}

impl StepReport {
    /// Builds a report from a finished step run.
    #[must_use]
    pub fn from_step_run(step_run: &StepRunEntity, reason: Option<String>) -> Self {
        Self {
            name: step_run.step_name.clone(),
            ordering: step_run.ordering,
            status: step_run.status,
            stats: step_run.stats,
            error: step_run
                .error
                .as_deref()
                .and_then(|trace| trace.lines().next())
                .map(str::to_string),
            reason,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: Uuid,
    /// Terminal run status.
    pub status: RunStatus,
    /// Steps in execution order.
    pub steps: Vec<StepReport>,
    /// Failures of steps that ran.
    pub failures: Vec<FailureRecord>,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

impl RunReport {
    /// Returns the report of one step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the status of one step.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StepRunStatus> {
        self.step(name).map(|s| s.status)
    }

    /// Returns true when the run completed without failures.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Returns the number of steps with `status`.
    #[must_use]
    pub fn count(&self, status: StepRunStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Sums the counters of every step.
    #[must_use]
    pub fn totals(&self) -> StepStats {
        self.steps.iter().fold(StepStats::default(), |mut acc, s| {
            acc.extracted += s.stats.extracted;
            acc.unique_inputs += s.stats.unique_inputs;
            acc.repeats_skipped += s.stats.repeats_skipped;
            acc.rows_skipped += s.stats.rows_skipped;
            acc.inserted += s.stats.inserted;
            acc.updated += s.stats.updated;
            acc.dropped += s.stats.dropped;
            acc.batches += s.stats.batches;
            acc.peak_memory_bytes = acc.peak_memory_bytes.max(s.stats.peak_memory_bytes);
            acc.runtime_ms += s.stats.runtime_ms;
            acc
        })
    }

    /// Converts to a dictionary for logging and events.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("status".to_string(), serde_json::json!(self.status.as_str()));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map.insert("completed".to_string(), serde_json::json!(self.count(StepRunStatus::Completed)));
        map.insert("failed".to_string(), serde_json::json!(self.count(StepRunStatus::Failed)));
        map.insert(
            "upstream_failed".to_string(),
            serde_json::json!(self.count(StepRunStatus::UpstreamFailed)),
        );
        map.insert("excluded".to_string(), serde_json::json!(self.count(StepRunStatus::Excluded)));
        map.insert(
            "steps".to_string(),
            serde_json::json!(self
                .steps
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "status": s.status.as_str(),
                        "inserted": s.stats.inserted,
                        "updated": s.stats.updated,
                        "unique_inputs": s.stats.unique_inputs,
                        "repeats_skipped": s.stats.repeats_skipped,
                        "runtime_ms": s.stats.runtime_ms,
                        "error": s.error,
                        "reason": s.reason,
                    })
                })
                .collect::<Vec<_>>()),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str, status: StepRunStatus, inserted: u64) -> StepReport {
        StepReport {
            name: name.to_string(),
            ordering: None,
            status,
            stats: StepStats {
                inserted,
                ..StepStats::default()
            },
            error: None,
            reason: None,
        }
    }

    #[test]
    fn test_to_dict_counts_statuses() {
        let run = RunReport {
            run_id: Uuid::nil(),
            status: RunStatus::Failed,
            steps: vec![
                report("a", StepRunStatus::Failed, 0),
                report("b", StepRunStatus::UpstreamFailed, 0),
                report("c", StepRunStatus::Completed, 4),
            ],
            failures: Vec::new(),
            duration_ms: 1.5,
        };

        let dict = run.to_dict();
        assert_eq!(dict["status"], "failed");
        assert_eq!(dict["failed"], 1);
        assert_eq!(dict["upstream_failed"], 1);
        assert_eq!(dict["completed"], 1);
        assert_eq!(dict["steps"].as_array().map(Vec::len), Some(3));
        assert_eq!(run.totals().inserted, 4);
        assert_eq!(run.status_of("b"), Some(StepRunStatus::UpstreamFailed));
        assert!(!run.succeeded());
    }
}
