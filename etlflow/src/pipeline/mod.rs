//! Step execution: extract, batch, transform, load.
//!
//! Two modes share the same building blocks. [`ExecutionMode::Sync`] walks
//! the extract in one task; [`ExecutionMode::Pipeline`] runs queue-connected
//! stages with a worker pool. Both go through [`run_step`], which owns the
//! extract lifecycle and the memory sampler.

mod batch;
mod counters;
mod executor;
mod loader;
mod memory;
mod sync;
mod worker_pool;

pub use batch::{process_batch, BatchResult, InputRow};
pub use counters::{StepCounters, StepStats};
pub use loader::{FlushOutcome, Loader};
pub use memory::MemorySampler;
pub use worker_pool::{join_job, JobHandle, WorkerPool};

use crate::cancellation::CancellationToken;
use crate::config::{ExecutionMode, PipelineConfig};
use crate::core::NodeOutput;
use crate::errors::EtlError;
use crate::events::{EventSink, BATCH_FLUSHED};
use crate::graph::{EtlStep, Extractor};
use crate::repeats::RepeatTracker;
use crate::store::{MetadataStore, TargetStore};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Everything one step run needs, shared by its stages.
#[derive(Clone)]
pub struct StepContext {
    /// The step graph.
    pub step: Arc<EtlStep>,
    /// Where loads write.
    pub target: Arc<dyn TargetStore>,
    /// Where repeats are persisted.
    pub metadata: Arc<dyn MetadataStore>,
    /// Repeat sets of this step.
    pub repeats: Arc<RepeatTracker>,
    /// Live counters.
    pub counters: Arc<StepCounters>,
    /// Lifecycle events.
    pub events: Arc<dyn EventSink>,
    /// Pipeline sizing.
    pub config: PipelineConfig,
    /// Run-level batch-size override.
    pub batch_size: Option<usize>,
    /// Cancelled on fatal errors or external interrupt.
    pub token: Arc<CancellationToken>,
}

impl StepContext {
    /// Converts an extracted value to an input row, or `None` for a repeat.
    ///
    /// # Errors
    ///
    /// Returns an [`EtlError::Arity`] when the value does not match the
    /// extract outputs.
    pub fn admit(&self, output: NodeOutput) -> Result<Option<InputRow>, EtlError> {
        let row = self.step.extract().resolve_row(output)?;
        self.counters.record_extracted();
        let hash = self.step.input_hash(&row);
        if self.repeats.admit(hash) {
            Ok(Some(InputRow { hash, row }))
        } else {
            self.counters.record_repeat();
            Ok(None)
        }
    }

    /// Records a finished flush in the counters and repeat sets.
    pub fn record_flush(&self, outcome: &FlushOutcome) {
        self.counters.record_write(outcome.stats);
        self.repeats.complete(&outcome.processed);
        self.events.try_emit(
            BATCH_FLUSHED,
            Some(json!({
                "step": self.step.name(),
                "batches": outcome.batches,
                "inputs": outcome.processed.len(),
                "inserted": outcome.stats.inserted,
                "updated": outcome.stats.updated,
                "dropped": outcome.stats.dropped,
            })),
        );

        let (done, total) = self.counters.progress();
        if let Some(total) = total {
            #[allow(clippy::cast_precision_loss)]
            let percent = (done as f64 / total.max(1) as f64) * 100.0;
            tracing::info!(
                step = %self.step.name(),
                done,
                total,
                percent = %format!("{percent:.1}"),
                "Progress"
            );
        } else {
            tracing::debug!(step = %self.step.name(), done, "Progress");
        }
    }

    /// Persists processed input hashes.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Metadata`] when the metadata store fails.
    pub async fn persist(&self, hashes: &[Uuid]) -> Result<(), EtlError> {
        self.repeats
            .persist(self.metadata.as_ref(), hashes)
            .await
            .map_err(EtlError::Metadata)
    }

    /// Returns the cancellation error for this step.
    #[must_use]
    pub fn cancelled_error(&self) -> EtlError {
        cancelled_error(&self.token)
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.step.name())
            .field("batch_size", &self.batch_size)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub(crate) fn cancelled_error(token: &CancellationToken) -> EtlError {
    EtlError::Cancelled(token.reason().unwrap_or_else(|| "cancelled".to_string()))
}

/// Picks the batch size for one step run.
///
/// An explicit size wins, then the configured one; otherwise the extract
/// length is split into `target_batch_count` batches, clamped to the
/// configured bounds. An unknown length uses `max_batch_size`.
#[must_use]
pub fn resolve_batch_size(explicit: Option<usize>, config: &PipelineConfig, length: Option<u64>) -> usize {
    let size = explicit.or(config.batch_size).unwrap_or_else(|| match length {
        Some(length) => {
            let length = usize::try_from(length).unwrap_or(usize::MAX);
            length
                .div_ceil(config.target_batch_count.max(1))
                .max(config.min_batch_size)
                .min(config.max_batch_size)
        }
        None => config.max_batch_size,
    });
    size.max(1)
}

/// Runs one step to completion.
///
/// Calls `setup` on the extractor, drives the chosen mode and always calls
/// `teardown` afterwards, also when `setup` failed. A teardown failure is
/// returned only when the run itself succeeded.
///
/// # Errors
///
/// Returns the setup error or the first fatal error of any stage.
pub async fn run_step(ctx: &StepContext, mode: ExecutionMode) -> Result<(), EtlError> {
    let extractor = Arc::clone(ctx.step.extract().extractor());
    let result = match extractor.setup().await {
        Ok(()) => sample_while_driving(ctx, mode, extractor.as_ref()).await,
        Err(err) => Err(err),
    };

    match (result, extractor.teardown().await) {
        (Ok(()), Err(teardown)) => Err(teardown),
        (Err(err), Err(teardown)) => {
            tracing::warn!(step = %ctx.step.name(), error = %teardown, "Extract teardown failed");
            Err(err)
        }
        (result, Ok(())) => result,
    }
}

async fn sample_while_driving(
    ctx: &StepContext,
    mode: ExecutionMode,
    extractor: &dyn Extractor,
) -> Result<(), EtlError> {
    let sampler_token = ctx.token.child();
    let sampler = tokio::spawn(MemorySampler::new().run(
        ctx.step.name().to_string(),
        ctx.config.memory_sample_interval(),
        Arc::clone(&ctx.counters),
        Arc::clone(&ctx.events),
        Arc::clone(&sampler_token),
    ));

    let result = drive(ctx, mode, extractor).await;

    sampler_token.cancel("step finished");
    if let Err(e) = sampler.await {
        tracing::warn!(step = %ctx.step.name(), error = %e, "Memory sampler ended abnormally");
    }
    result
}

async fn drive(ctx: &StepContext, mode: ExecutionMode, extractor: &dyn Extractor) -> Result<(), EtlError> {
    let length = extractor.length().await?;
    if let Some(length) = length {
        ctx.counters.set_total(length);
    }
    let batch_size = resolve_batch_size(ctx.step.batch_size().or(ctx.batch_size), &ctx.config, length);
    tracing::debug!(
        step = %ctx.step.name(),
        ?mode,
        batch_size,
        length = ?length,
        "Starting extract"
    );

    let rows = extractor.extract().await?;
    match mode {
        ExecutionMode::Sync => sync::run(ctx, rows, batch_size).await,
        ExecutionMode::Pipeline => executor::run(ctx, rows, batch_size).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_batch_size() {
        let config = PipelineConfig::default();

        assert_eq!(resolve_batch_size(Some(7), &config, Some(1_000_000)), 7);
        assert_eq!(resolve_batch_size(None, &config, Some(50_000)), 500);
        assert_eq!(resolve_batch_size(None, &config, Some(5)), config.min_batch_size);
        assert_eq!(resolve_batch_size(None, &config, Some(u64::MAX)), config.max_batch_size);
        assert_eq!(resolve_batch_size(None, &config, None), config.max_batch_size);

        let fixed = PipelineConfig::default().with_batch_size(64);
        assert_eq!(resolve_batch_size(None, &fixed, Some(50_000)), 64);
        assert_eq!(resolve_batch_size(Some(3), &fixed, None), 3);
    }

    #[test]
    fn test_resolve_batch_size_inverted_bounds() {
        let config = PipelineConfig {
            min_batch_size: 1000,
            max_batch_size: 10,
            ..PipelineConfig::default()
        };
        assert_eq!(resolve_batch_size(None, &config, Some(50)), 10);
        assert_eq!(resolve_batch_size(None, &config, None), 10);
    }
}
