//! Queue-connected pipeline execution.
//!
//! ```text
//! extractor -> launcher -> [worker pool] -> collector -> loader -> persister
//! ```
//!
//! Stages are joined by bounded channels; a stage ends when its input
//! channel closes, which closes its own output in turn. All stages run in
//! one [`StructuredTaskGroup`], so the first failure cancels the rest.

use super::{
    cancelled_error, join_job, process_batch, BatchResult, InputRow, JobHandle, Loader,
    StepContext, WorkerPool,
};
use crate::cancellation::{CancellationToken, StructuredTaskGroup};
use crate::core::NodeOutput;
use crate::errors::EtlError;
use crate::observability::SpanTimer;
use futures::stream::{BoxStream, FuturesOrdered, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use uuid::Uuid;

type Rows = BoxStream<'static, Result<NodeOutput, EtlError>>;

pub(super) async fn run(ctx: &StepContext, rows: Rows, batch_size: usize) -> Result<(), EtlError> {
    let timer = SpanTimer::start(format!("pipeline:{}", ctx.step.name()));
    let capacity = ctx.config.queue_capacity;
    let group = StructuredTaskGroup::with_token(ctx.token.child());
    let pool = WorkerPool::with_token(ctx.config.worker_count(), group.cancel_token());

    let (row_tx, row_rx) = mpsc::channel::<InputRow>(batch_size.max(capacity));
    let (job_tx, job_rx) = mpsc::channel::<JobHandle<BatchResult>>(capacity);
    let (result_tx, result_rx) = mpsc::channel::<BatchResult>(capacity);
    let (done_tx, done_rx) = mpsc::channel::<Vec<Uuid>>(capacity);

    tracing::debug!(
        step = %ctx.step.name(),
        workers = pool.size(),
        batch_size,
        queue_capacity = capacity,
        "Starting pipeline"
    );

    let stage_ctx = ctx.clone();
    group.spawn("extractor", move |token| extract_stage(stage_ctx, rows, row_tx, token));
    let stage_ctx = ctx.clone();
    group.spawn("launcher", move |token| {
        launch_stage(stage_ctx, pool, row_rx, job_tx, batch_size, token)
    });
    let stage_ctx = ctx.clone();
    group.spawn("collector", move |token| collect_stage(stage_ctx, job_rx, result_tx, token));
    let stage_ctx = ctx.clone();
    group.spawn("loader", move |token| load_stage(stage_ctx, result_rx, done_tx, token));
    let stage_ctx = ctx.clone();
    group.spawn("persister", move |token| persist_stage(stage_ctx, done_rx, token));

    let result = group.wait().await;
    tracing::debug!(
        step = %ctx.step.name(),
        elapsed_ms = timer.elapsed_ms(),
        ok = result.is_ok(),
        "Pipeline finished"
    );
    result
}

/// Pulls rows, drops repeats and forwards the rest.
async fn extract_stage(
    ctx: StepContext,
    mut rows: Rows,
    tx: Sender<InputRow>,
    token: Arc<CancellationToken>,
) -> Result<(), EtlError> {
    let yield_every = ctx.config.extractor_yield_every.max(1);
    let mut since_yield = 0usize;
    loop {
        let next = tokio::select! {
            () = token.cancelled() => return Err(cancelled_error(&token)),
            next = rows.next() => next,
        };
        let Some(output) = next else {
            break;
        };
        if let Some(input) = ctx.admit(output?)? {
            if tx.send(input).await.is_err() {
                // Downstream already stopped; its error is reported instead.
                return Ok(());
            }
        }
        since_yield += 1;
        if since_yield >= yield_every {
            since_yield = 0;
            tokio::task::yield_now().await;
        }
    }
    tracing::debug!(step = %ctx.step.name(), "Extract exhausted");
    Ok(())
}

/// Groups rows into batches and submits each as one worker job.
async fn launch_stage(
    ctx: StepContext,
    pool: WorkerPool,
    mut rx: Receiver<InputRow>,
    jobs: Sender<JobHandle<BatchResult>>,
    batch_size: usize,
    token: Arc<CancellationToken>,
) -> Result<(), EtlError> {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        let next = tokio::select! {
            () = token.cancelled() => return Err(cancelled_error(&token)),
            next = rx.recv() => next,
        };
        let exhausted = next.is_none();
        if let Some(input) = next {
            batch.push(input);
        }

        if batch.len() >= batch_size || (exhausted && !batch.is_empty()) {
            let work = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            let step = Arc::clone(&ctx.step);
            tracing::trace!(step = %ctx.step.name(), rows = work.len(), "Submitting batch");
            let handle = pool.submit(move || process_batch(&step, work)).await?;
            if jobs.send(handle).await.is_err() {
                return Ok(());
            }
        }
        if exhausted {
            return Ok(());
        }
    }
}

/// Awaits submitted jobs in submission order and forwards their results.
///
/// Waiting for a job is bounded by the poll interval so new submissions are
/// picked up while earlier jobs are still running.
async fn collect_stage(
    ctx: StepContext,
    mut jobs: Receiver<JobHandle<BatchResult>>,
    results: Sender<BatchResult>,
    token: Arc<CancellationToken>,
) -> Result<(), EtlError> {
    let poll = ctx.config.poll_interval();
    let mut in_flight = FuturesOrdered::new();
    let mut open = true;

    while open || !in_flight.is_empty() {
        if token.is_cancelled() {
            return Err(cancelled_error(&token));
        }

        if open && in_flight.is_empty() {
            let next = tokio::select! {
                () = token.cancelled() => return Err(cancelled_error(&token)),
                next = jobs.recv() => next,
            };
            match next {
                Some(handle) => in_flight.push_back(join_job(handle)),
                None => open = false,
            }
            continue;
        }
        while open {
            match jobs.try_recv() {
                Ok(handle) => in_flight.push_back(join_job(handle)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => open = false,
            }
        }

        if let Ok(Some(finished)) = tokio::time::timeout(poll, in_flight.next()).await {
            let result = finished?;
            ctx.counters
                .record_batch(result.processed.len() as u64, result.skipped);
            if results.send(result).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Coalesces pending results and flushes them.
async fn load_stage(
    ctx: StepContext,
    mut results: Receiver<BatchResult>,
    done: Sender<Vec<Uuid>>,
    token: Arc<CancellationToken>,
) -> Result<(), EtlError> {
    let coalesce_limit = ctx.config.coalesce_limit.max(1);
    let mut loader = Loader::new(
        Arc::clone(&ctx.step),
        Arc::clone(&ctx.target),
        ctx.config.fk_retry_limit,
    );

    loop {
        let next = tokio::select! {
            () = token.cancelled() => return Err(cancelled_error(&token)),
            next = results.recv() => next,
        };
        let Some(first) = next else {
            return Ok(());
        };
        loader.absorb(first);
        while loader.pending_batches() < coalesce_limit {
            match results.try_recv() {
                Ok(result) => loader.absorb(result),
                Err(_) => break,
            }
        }

        let timer = SpanTimer::start("flush");
        let outcome = loader.flush().await?;
        tracing::debug!(
            step = %ctx.step.name(),
            batches = outcome.batches,
            inputs = outcome.processed.len(),
            elapsed_ms = timer.elapsed_ms(),
            "Flush complete"
        );
        ctx.record_flush(&outcome);
        if done.send(outcome.processed).await.is_err() {
            return Ok(());
        }
    }
}

/// Persists the input hashes of flushed rows.
async fn persist_stage(
    ctx: StepContext,
    mut done: Receiver<Vec<Uuid>>,
    token: Arc<CancellationToken>,
) -> Result<(), EtlError> {
    loop {
        let next = tokio::select! {
            () = token.cancelled() => return Err(cancelled_error(&token)),
            next = done.recv() => next,
        };
        let Some(hashes) = next else {
            return Ok(());
        };
        ctx.persist(&hashes).await?;
    }
}
