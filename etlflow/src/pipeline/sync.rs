//! Single-task execution: extract a batch, process it, flush it, repeat.

use super::{process_batch, InputRow, Loader, StepContext};
use crate::core::NodeOutput;
use crate::errors::EtlError;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;

pub(super) async fn run(
    ctx: &StepContext,
    mut rows: BoxStream<'static, Result<NodeOutput, EtlError>>,
    batch_size: usize,
) -> Result<(), EtlError> {
    let mut loader = Loader::new(
        Arc::clone(&ctx.step),
        Arc::clone(&ctx.target),
        ctx.config.fk_retry_limit,
    );
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(output) = rows.next().await {
        if ctx.token.is_cancelled() {
            return Err(ctx.cancelled_error());
        }
        if let Some(input) = ctx.admit(output?)? {
            batch.push(input);
        }
        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            flush_batch(ctx, &mut loader, full).await?;
        }
    }
    if !batch.is_empty() {
        flush_batch(ctx, &mut loader, batch).await?;
    }
    Ok(())
}

async fn flush_batch(ctx: &StepContext, loader: &mut Loader, batch: Vec<InputRow>) -> Result<(), EtlError> {
    let result = process_batch(&ctx.step, batch)?;
    ctx.counters
        .record_batch(result.processed.len() as u64, result.skipped);
    loader.absorb(result);

    let outcome = loader.flush().await?;
    ctx.record_flush(&outcome);
    ctx.persist(&outcome.processed).await
}
