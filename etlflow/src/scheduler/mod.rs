//! Ordering and running the steps of a model.
//!
//! Steps run one after another in dependency order. Each step run moves
//! through `initialized -> (excluded | upstream_failed | running ->
//! (completed | failed))`; the run itself is failed when any step failed.

mod failure;
mod graph;
mod report;
mod runner;
mod selection;

pub use failure::{FailurePolicy, FailureRecord, FailureTracker};
pub use graph::DependencyGraph;
pub use report::{RunReport, StepReport};
pub use runner::StepRunner;
pub use selection::{select, Exclusion};

use crate::config::RunConfig;
use crate::core::{RunStatus, StepRunStatus};
use crate::errors::{CycleDetectedError, EtlError, ValidationError};
use crate::events::{RUN_COMPLETED, RUN_STARTED};
use crate::graph::EtlStep;
use crate::observability::SpanTimer;
use crate::store::{RunEntity, StepRecord, StepRunEntity};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// A step with its position and selection outcome.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// The step.
    pub step: Arc<EtlStep>,
    /// Position in execution order.
    pub ordering: i32,
    /// Why the step does not run, if it does not.
    pub exclusion: Option<Exclusion>,
}

/// Orders steps by their data dependencies and runs them.
#[derive(Debug, Clone)]
pub struct StepScheduler {
    steps: Vec<Arc<EtlStep>>,
    graph: DependencyGraph,
}

impl StepScheduler {
    /// Builds the cross-step graph.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleDetectedError`] for cyclic step dependencies.
    pub fn new(steps: &[Arc<EtlStep>]) -> Result<Self, CycleDetectedError> {
        let graph = DependencyGraph::build(steps)?;
        Ok(Self {
            steps: steps.to_vec(),
            graph,
        })
    }

    /// Returns the dependency graph.
    #[must_use]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn ordered(&self) -> Vec<&Arc<EtlStep>> {
        self.graph.order().iter().map(|&i| &self.steps[i]).collect()
    }

    /// Applies the run's selection to the ordered steps.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for unknown or inverted bounds.
    pub fn plan(&self, config: &RunConfig) -> Result<Vec<PlannedStep>, ValidationError> {
        let ordered = self.ordered();
        let refs: Vec<&EtlStep> = ordered.iter().map(|s| s.as_ref()).collect();
        let selection = select(&refs, config)?;
        Ok(ordered
            .into_iter()
            .zip(selection)
            .enumerate()
            .map(|(i, (step, exclusion))| PlannedStep {
                step: Arc::clone(step),
                ordering: i32::try_from(i).unwrap_or(i32::MAX),
                exclusion,
            })
            .collect())
    }

    /// Runs every planned step and records the run.
    ///
    /// Step failures are recorded and handled by the failure policy; they
    /// never abort the run.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Validation`] for a bad selection and
    /// [`EtlError::Metadata`] when the metadata store fails.
    pub async fn run(&self, runner: &StepRunner, config: &RunConfig) -> Result<RunReport, EtlError> {
        let plan = self.plan(config)?;
        let metadata = runner.metadata();
        let timer = SpanTimer::start("run");

        let mut run = RunEntity::new(config.run_id.unwrap_or_else(Uuid::now_v7));
        run.start();
        metadata.create_run(&run).await.map_err(EtlError::Metadata)?;
        for planned in &plan {
            metadata
                .upsert_step(&StepRecord::from(planned.step.as_ref()))
                .await
                .map_err(EtlError::Metadata)?;
        }
        tracing::info!(
            run_id = %run.id,
            steps = plan.len(),
            selected = plan.iter().filter(|p| p.exclusion.is_none()).count(),
            policy = ?config.failure_policy,
            "Run started"
        );
        runner
            .events()
            .emit(RUN_STARTED, Some(json!({"run_id": run.id, "steps": plan.len()})))
            .await;

        let mut tracker = FailureTracker::new(config.failure_policy);
        let mut steps = Vec::with_capacity(plan.len());
        for planned in &plan {
            let step = &planned.step;
            let mut step_run = StepRunEntity::new(step, run.id, Some(planned.ordering));

            let reason = if let Some(exclusion) = &planned.exclusion {
                let reason = exclusion.to_string();
                runner
                    .skip(&mut step_run, StepRunStatus::Excluded, &reason)
                    .await?;
                Some(reason)
            } else if runner.token().is_cancelled() {
                let reason = format!(
                    "run cancelled: {}",
                    runner.token().reason().unwrap_or_default()
                );
                runner
                    .skip(&mut step_run, StepRunStatus::UpstreamFailed, &reason)
                    .await?;
                tracker.record_upstream_failure(step);
                Some(reason)
            } else if let Some(blocker) = tracker.blocked_by(step) {
                let reason = format!("upstream step '{blocker}' failed");
                runner
                    .skip(&mut step_run, StepRunStatus::UpstreamFailed, &reason)
                    .await?;
                tracker.record_upstream_failure(step);
                Some(reason)
            } else {
                match runner.run(step, &mut step_run, config).await {
                    Ok(()) => {}
                    Err(err) if err.is_unrecoverable() => {
                        tracing::error!(run_id = %run.id, step = %step.name(), error = %err, "Aborting run");
                        return Err(err);
                    }
                    Err(err) => tracker.record_failure(step, &err),
                }
                None
            };
            steps.push(StepReport::from_step_run(&step_run, reason));
        }

        run.finish(tracker.failure_count() as u64);
        if runner.token().is_cancelled() {
            run.status = RunStatus::Failed;
        }
        metadata.update_run(&run).await.map_err(EtlError::Metadata)?;

        let report = RunReport {
            run_id: run.id,
            status: run.status,
            steps,
            failures: tracker.records().to_vec(),
            duration_ms: timer.finish(),
        };
        tracing::info!(
            run_id = %run.id,
            status = %run.status,
            failed = tracker.failure_count(),
            duration_ms = report.duration_ms,
            "Run finished"
        );
        runner
            .events()
            .emit(RUN_COMPLETED, Some(serde_json::to_value(report.to_dict())?))
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeOutput;
    use crate::graph::{Dependency, ExtractNode, IterExtract};

    fn step(name: &str, dependency: Dependency) -> Arc<EtlStep> {
        let extract = ExtractNode::builder(format!("{name}_source"))
            .outputs(["v"])
            .build(IterExtract::from_rows(name, vec![NodeOutput::scalar(1)]))
            .unwrap();
        Arc::new(
            EtlStep::builder(name)
                .extract(extract)
                .dependency(dependency)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_plan_orders_and_numbers_steps() {
        let reader = step("b", Dependency::new().needs_table("x"));
        let writer = step("a", Dependency::new().yields_table("x"));
        let scheduler = StepScheduler::new(&[reader, writer]).unwrap();

        let plan = scheduler.plan(&RunConfig::new().exclude("b")).unwrap();
        let names: Vec<&str> = plan.iter().map(|p| p.step.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(plan[0].ordering, 0);
        assert_eq!(plan[1].ordering, 1);
        assert!(plan[0].exclusion.is_none());
        assert!(plan[1].exclusion.is_some());
    }

    #[test]
    fn test_cyclic_steps_are_rejected() {
        let a = step("a", Dependency::new().needs_table("y").yields_table("x"));
        let b = step("b", Dependency::new().needs_table("x").yields_table("y"));
        assert!(StepScheduler::new(&[a, b]).is_err());
    }
}
