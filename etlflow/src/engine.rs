//! The engine: a model bound to its stores, configuration and event sink.

use crate::cancellation::CancellationToken;
use crate::config::{EngineConfig, RunConfig};
use crate::errors::EtlError;
use crate::events::{EventSink, LoggingEventSink};
use crate::model::EtlModel;
use crate::scheduler::{RunReport, StepRunner, StepScheduler};
use crate::store::{MetadataStore, RunEntity, StepRecord, StepRunEntity, TargetStore};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Exit status of a single-step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StepExitCode {
    /// The step completed.
    Success = 0,
    /// The step ran and failed.
    Failure = 1,
    /// The step could not be run or its state could not be recorded.
    Fatal = 2,
}

impl StepExitCode {
    /// Returns the process exit code.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Runs the steps of a model against a target and a metadata store.
pub struct Engine {
    model: EtlModel,
    target: Arc<dyn TargetStore>,
    metadata: Arc<dyn MetadataStore>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
    token: Arc<CancellationToken>,
}

impl Engine {
    /// Creates an engine with default configuration, logging events through
    /// `tracing`.
    #[must_use]
    pub fn new(model: EtlModel, target: Arc<dyn TargetStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            model,
            target,
            metadata,
            events: Arc::new(LoggingEventSink::debug()),
            config: EngineConfig::default(),
            token: Arc::new(CancellationToken::new()),
        }
    }

    /// Connects to PostgreSQL for both stores, creating the metadata tables
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Internal`] for an invalid configuration, and
    /// [`EtlError::Metadata`] when either pool cannot connect or the
    /// migration fails.
    #[cfg(feature = "postgres")]
    pub async fn connect(model: EtlModel, config: EngineConfig) -> Result<Self, EtlError> {
        use crate::store::postgres::{create_pool, PgMetadataStore, PgTargetStore};

        config
            .validate()
            .map_err(|e| EtlError::Internal(format!("Invalid configuration: {e:#}")))?;
        let target_pool = create_pool(&config.database, &config.database.url)
            .await
            .map_err(EtlError::Metadata)?;
        let metadata_pool = if config.database.metadata_url.is_some() {
            create_pool(&config.database, config.database.metadata_url())
                .await
                .map_err(EtlError::Metadata)?
        } else {
            target_pool.clone()
        };
        let metadata = PgMetadataStore::new(metadata_pool);
        metadata.migrate().await.map_err(EtlError::Metadata)?;

        Ok(Self::new(model, Arc::new(PgTargetStore::new(target_pool)), Arc::new(metadata)).with_config(config))
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the model.
    #[must_use]
    pub fn model(&self) -> &EtlModel {
        &self.model
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the token that interrupts the current and later runs.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.token)
    }

    /// Cancels the engine's token when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let token = Arc::clone(&self.token);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::warn!("Interrupt received, cancelling run");
                    token.cancel("interrupted");
                }
                Err(err) => tracing::error!(error = %err, "Failed to listen for Ctrl-C"),
            }
        })
    }

    fn runner(&self) -> StepRunner {
        StepRunner::new(
            Arc::clone(&self.target),
            Arc::clone(&self.metadata),
            Arc::clone(&self.events),
            self.config.pipeline.clone(),
            Arc::clone(&self.token),
        )
    }

    /// Orders the model's steps by their dependencies.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::CycleDetected`] for cyclic step dependencies.
    pub fn scheduler(&self) -> Result<StepScheduler, EtlError> {
        Ok(StepScheduler::new(self.model.steps())?)
    }

    /// Runs the selected steps of the model in dependency order.
    ///
    /// Step failures are reported in the returned [`RunReport`].
    ///
    /// # Errors
    ///
    /// Returns an error for a cyclic model or a bad selection before the
    /// run starts, and [`EtlError::Metadata`] when run state cannot be
    /// recorded.
    pub async fn run(&self, config: &RunConfig) -> Result<RunReport, EtlError> {
        let scheduler = self.scheduler()?;
        scheduler.run(&self.runner(), config).await
    }

    /// Runs one step of the model as part of run `run_id`, creating the run
    /// when it is not yet recorded.
    ///
    /// This is the boundary used by an external invocation layer that
    /// schedules steps itself; selection and failure policy do not apply.
    pub async fn execute_step(
        &self,
        step_name: &str,
        run_id: Option<Uuid>,
        config: &RunConfig,
        ordering: Option<i32>,
    ) -> StepExitCode {
        let Some(step) = self.model.step(step_name) else {
            tracing::error!(step = %step_name, "Unknown step");
            return StepExitCode::Fatal;
        };
        let run_id = run_id.or(config.run_id).unwrap_or_else(Uuid::now_v7);

        if let Err(err) = self.ensure_run(run_id, step).await {
            tracing::error!(step = %step_name, run_id = %run_id, error = %err, "Cannot record step");
            return StepExitCode::Fatal;
        }

        let mut step_run = StepRunEntity::new(step, run_id, ordering);
        match self.runner().run(step, &mut step_run, config).await {
            Ok(()) => StepExitCode::Success,
            Err(err) if err.is_unrecoverable() || matches!(err, EtlError::Validation(_)) => StepExitCode::Fatal,
            Err(_) => StepExitCode::Failure,
        }
    }

    async fn ensure_run(&self, run_id: Uuid, step: &crate::graph::EtlStep) -> Result<(), EtlError> {
        let existing = self.metadata.get_run(run_id).await.map_err(EtlError::Metadata)?;
        if existing.is_none() {
            let mut run = RunEntity::new(run_id);
            run.start();
            self.metadata.create_run(&run).await.map_err(EtlError::Metadata)?;
        }
        self.metadata
            .upsert_step(&StepRecord::from(step))
            .await
            .map_err(EtlError::Metadata)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("steps", &self.model.len())
            .field("config", &self.config)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StepExitCode::Success.code(), 0);
        assert_eq!(StepExitCode::Failure.code(), 1);
        assert_eq!(StepExitCode::Fatal.code(), 2);
    }

    #[tokio::test]
    async fn test_unknown_step_is_fatal() {
        let engine = Engine::new(
            EtlModel::new(),
            Arc::new(crate::store::MemoryTargetStore::new()),
            Arc::new(crate::store::MemoryMetadataStore::new()),
        );
        let code = engine.execute_step("missing", None, &RunConfig::new(), None).await;
        assert_eq!(code, StepExitCode::Fatal);
    }
}
