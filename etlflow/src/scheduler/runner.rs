//! Lifecycle of a single step run.

use crate::cancellation::CancellationToken;
use crate::config::{PipelineConfig, RunConfig};
use crate::core::StepRunStatus;
use crate::errors::EtlError;
use crate::events::{
    EventSink, STEP_COMPLETED, STEP_EXCLUDED, STEP_FAILED, STEP_STARTED, STEP_UPSTREAM_FAILED,
};
use crate::graph::EtlStep;
use crate::observability::SpanTimer;
use crate::pipeline::{run_step, StepContext, StepCounters};
use crate::repeats::RepeatTracker;
use crate::store::{MetadataStore, StepRunEntity, TargetStore};
use serde_json::json;
use std::sync::Arc;

/// Runs steps against a pair of stores and records every transition.
#[derive(Clone)]
pub struct StepRunner {
    target: Arc<dyn TargetStore>,
    metadata: Arc<dyn MetadataStore>,
    events: Arc<dyn EventSink>,
    pipeline: PipelineConfig,
    token: Arc<CancellationToken>,
}

impl StepRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        target: Arc<dyn TargetStore>,
        metadata: Arc<dyn MetadataStore>,
        events: Arc<dyn EventSink>,
        pipeline: PipelineConfig,
        token: Arc<CancellationToken>,
    ) -> Self {
        Self {
            target,
            metadata,
            events,
            pipeline,
            token,
        }
    }

    /// Returns the metadata store.
    #[must_use]
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Returns the run-wide cancellation token.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Runs `step`, moving `step_run` to running and then to completed or
    /// failed. The step run is saved at both transitions.
    ///
    /// # Errors
    ///
    /// Returns the step's failure. [`EtlError::Metadata`] means the state
    /// could not be recorded.
    pub async fn run(
        &self,
        step: &Arc<EtlStep>,
        step_run: &mut StepRunEntity,
        config: &RunConfig,
    ) -> Result<(), EtlError> {
        step_run.transition(StepRunStatus::Running)?;
        step_run.rendered_query = step.extract().extractor().rendered_query();
        self.save(step_run).await?;
        tracing::info!(step = %step.name(), run_id = %step_run.run_id, mode = ?config.mode, "Step started");
        self.events
            .emit(STEP_STARTED, Some(json!({"step": step.name(), "run_id": step_run.run_id})))
            .await;

        let timer = SpanTimer::start(step.name());
        let counters = Arc::new(StepCounters::new());
        let result = self.execute(step, config, &counters).await;

        let mut stats = counters.snapshot();
        stats.runtime_ms = timer.finish();
        step_run.stats = stats;

        match &result {
            Ok(()) => {
                step_run.transition(StepRunStatus::Completed)?;
                self.save(step_run).await?;
                tracing::info!(
                    step = %step.name(),
                    inserted = stats.inserted,
                    updated = stats.updated,
                    unique_inputs = stats.unique_inputs,
                    repeats_skipped = stats.repeats_skipped,
                    rows_skipped = stats.rows_skipped,
                    runtime_ms = stats.runtime_ms,
                    "Step completed"
                );
                self.events
                    .emit(
                        STEP_COMPLETED,
                        Some(json!({"step": step.name(), "stats": stats})),
                    )
                    .await;
            }
            Err(err) => {
                step_run.error = Some(err.trace_text());
                step_run.transition(StepRunStatus::Failed)?;
                if !err.is_unrecoverable() {
                    self.save(step_run).await?;
                }
                tracing::error!(step = %step.name(), error = %err, kind = err.kind(), "Step failed");
                self.events
                    .emit(
                        STEP_FAILED,
                        Some(json!({"step": step.name(), "error": err.to_string(), "kind": err.kind()})),
                    )
                    .await;
            }
        }
        result
    }

    async fn execute(
        &self,
        step: &Arc<EtlStep>,
        config: &RunConfig,
        counters: &Arc<StepCounters>,
    ) -> Result<(), EtlError> {
        if self.token.is_cancelled() {
            return Err(crate::pipeline::cancelled_error(&self.token));
        }
        let repeats = RepeatTracker::load(self.metadata.as_ref(), step.identity(), config.retry)
            .await
            .map_err(EtlError::Metadata)?;
        let ctx = StepContext {
            step: Arc::clone(step),
            target: Arc::clone(&self.target),
            metadata: Arc::clone(&self.metadata),
            repeats: Arc::new(repeats),
            counters: Arc::clone(counters),
            events: Arc::clone(&self.events),
            config: self.pipeline.clone(),
            batch_size: config.batch_size,
            token: self.token.child(),
        };
        run_step(&ctx, config.mode).await
    }

    /// Marks a step that will not run as excluded or upstream-failed.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Metadata`] when the step run cannot be saved.
    pub async fn skip(
        &self,
        step_run: &mut StepRunEntity,
        status: StepRunStatus,
        reason: &str,
    ) -> Result<(), EtlError> {
        step_run.transition(status)?;
        self.save(step_run).await?;
        let event = if status == StepRunStatus::Excluded {
            tracing::debug!(step = %step_run.step_name, reason, "Step excluded");
            STEP_EXCLUDED
        } else {
            tracing::warn!(step = %step_run.step_name, reason, "Step skipped after upstream failure");
            STEP_UPSTREAM_FAILED
        };
        self.events
            .emit(event, Some(json!({"step": step_run.step_name, "reason": reason})))
            .await;
        Ok(())
    }

    async fn save(&self, step_run: &StepRunEntity) -> Result<(), EtlError> {
        self.metadata
            .save_step_run(step_run)
            .await
            .map_err(EtlError::Metadata)
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("pipeline", &self.pipeline)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
