//! Target and metadata stores.
//!
//! [`TargetStore`] receives flushed load buffers; [`MetadataStore`] keeps
//! runs, steps, step runs and repeat hashes. Both have an in-memory
//! implementation and, with the `postgres` feature, a PostgreSQL one.

mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryMetadataStore, MemoryTargetStore};

use crate::core::{RunStatus, StepRunStatus};
use crate::errors::{EtlError, StoreError};
use crate::graph::{EtlStep, LoadEntity, PreparedRow, StepDefinition, WriteMode, WriteStats};
use crate::pipeline::StepStats;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Where loads write their rows.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Writes one flush of rows for one load atomically.
    ///
    /// `rows` carry values aligned with `columns`, whose first entry is the
    /// primary key. Keys are unique within one call.
    async fn bulk_write(
        &self,
        entity: &LoadEntity,
        columns: &[String],
        rows: &[PreparedRow],
        mode: WriteMode,
    ) -> Result<WriteStats, StoreError>;

    /// Returns the number of rows in the entity's table.
    async fn row_count(&self, entity: &LoadEntity) -> Result<u64, StoreError>;
}

/// Persisted run, step and repeat state.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records a new run.
    async fn create_run(&self, run: &RunEntity) -> Result<(), StoreError>;

    /// Overwrites a run's mutable fields.
    async fn update_run(&self, run: &RunEntity) -> Result<(), StoreError>;

    /// Returns a run by id.
    async fn get_run(&self, id: Uuid) -> Result<Option<RunEntity>, StoreError>;

    /// Inserts or refreshes a step definition.
    async fn upsert_step(&self, step: &StepRecord) -> Result<(), StoreError>;

    /// Inserts or overwrites the step run for `(step_id, run_id)`.
    async fn save_step_run(&self, step_run: &StepRunEntity) -> Result<(), StoreError>;

    /// Returns the step runs of a run, ordered by `ordering`.
    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRunEntity>, StoreError>;

    /// Returns every input hash recorded for a step.
    async fn load_repeats(&self, step_id: Uuid) -> Result<HashSet<Uuid>, StoreError>;

    /// Appends input hashes for a step; already-present hashes are ignored.
    async fn persist_repeats(&self, step_id: Uuid, hashes: &[Uuid]) -> Result<(), StoreError>;
}

/// One invocation of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntity {
    /// Run id.
    pub id: Uuid,
    /// Aggregate status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed steps.
    pub error_count: u64,
}

impl RunEntity {
    /// Creates an initialized run.
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            status: RunStatus::Initialized,
            started_at: None,
            completed_at: None,
            error_count: 0,
        }
    }

    /// Marks the run as running.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Marks the run terminal: failed when any step failed.
    pub fn finish(&mut self, error_count: u64) {
        self.error_count = error_count;
        self.status = if error_count > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        self.completed_at = Some(Utc::now());
    }
}

/// The persisted row for a step definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step identity.
    pub id: Uuid,
    /// Step name.
    pub name: String,
    /// Description.
    pub description: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Tables the step needs.
    pub tables_needed: Vec<String>,
    /// Columns the step needs.
    pub columns_needed: Vec<String>,
    /// Tables the step yields.
    pub tables_yielded: Vec<String>,
    /// Columns the step yields.
    pub columns_yielded: Vec<String>,
    /// Serialized definition.
    pub definition: StepDefinition,
}

impl From<&EtlStep> for StepRecord {
    fn from(step: &EtlStep) -> Self {
        let dep = step.dependency();
        Self {
            id: step.identity(),
            name: step.name().to_string(),
            description: step.description().map(str::to_string),
            tags: step.tags().iter().cloned().collect(),
            tables_needed: dep.tables_needed().iter().cloned().collect(),
            columns_needed: dep.columns_needed().iter().cloned().collect(),
            tables_yielded: dep.tables_yielded().iter().cloned().collect(),
            columns_yielded: dep.columns_yielded().iter().cloned().collect(),
            definition: step.definition(),
        }
    }
}

/// One step within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunEntity {
    /// Step identity.
    pub step_id: Uuid,
    /// Run id.
    pub run_id: Uuid,
    /// Step name, for display.
    pub step_name: String,
    /// Position in the run's execution order.
    pub ordering: Option<i32>,
    /// Current status.
    pub status: StepRunStatus,
    /// Counters.
    pub stats: StepStats,
    /// Full error trace of a failure.
    pub error: Option<String>,
    /// The extract query as sent to the source.
    pub rendered_query: Option<String>,
    /// When the step started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRunEntity {
    /// Creates an initialized step run.
    #[must_use]
    pub fn new(step: &EtlStep, run_id: Uuid, ordering: Option<i32>) -> Self {
        Self {
            step_id: step.identity(),
            run_id,
            step_name: step.name().to_string(),
            ordering,
            status: StepRunStatus::Initialized,
            stats: StepStats::default(),
            error: None,
            rendered_query: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Moves to `next`, stamping start and completion times.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Internal`] for a transition the state machine
    /// does not allow.
    pub fn transition(&mut self, next: StepRunStatus) -> Result<(), EtlError> {
        if !self.status.can_transition_to(next) {
            return Err(EtlError::Internal(format!(
                "Step run '{}' cannot move from {} to {}",
                self.step_name, self.status, next
            )));
        }
        self.status = next;
        if next == StepRunStatus::Running {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_finish() {
        let mut run = RunEntity::new(Uuid::nil());
        run.start();
        assert_eq!(run.status, RunStatus::Running);
        run.finish(0);
        assert_eq!(run.status, RunStatus::Completed);

        let mut failed = RunEntity::new(Uuid::nil());
        failed.start();
        failed.finish(2);
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error_count, 2);
        assert!(failed.completed_at.is_some());
    }
}
