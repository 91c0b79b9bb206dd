//! Buffering and flushing of prepared load rows.

use super::batch::BatchResult;
use crate::errors::{EtlError, StoreError};
use crate::graph::{ComputationalNode, EtlStep, LoadBuffer, LoadNode, PreparedRow, WriteStats};
use crate::store::TargetStore;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What one flush wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushOutcome {
    /// Write counts across all loads.
    pub stats: WriteStats,
    /// Input hashes whose rows are now written.
    pub processed: Vec<Uuid>,
    /// Batches coalesced into this flush.
    pub batches: usize,
}

/// Buffers batch results per load and writes them in load order.
///
/// Parent loads flush before their children, so child foreign keys see
/// parent rows written by the same flush.
pub struct Loader {
    step: Arc<EtlStep>,
    target: Arc<dyn TargetStore>,
    buffers: Vec<LoadBuffer>,
    processed: Vec<Uuid>,
    batches: usize,
    fk_retry_limit: usize,
}

impl Loader {
    /// Creates a loader for `step`.
    #[must_use]
    pub fn new(step: Arc<EtlStep>, target: Arc<dyn TargetStore>, fk_retry_limit: usize) -> Self {
        let buffers = (0..step.loads().len()).map(|_| LoadBuffer::new()).collect();
        Self {
            step,
            target,
            buffers,
            processed: Vec::new(),
            batches: 0,
            fk_retry_limit,
        }
    }

    /// Adds a batch result to the buffers.
    pub fn absorb(&mut self, result: BatchResult) {
        for (buffer, rows) in self.buffers.iter_mut().zip(result.loads) {
            buffer.extend(rows);
        }
        self.processed.extend(result.processed);
        self.batches += 1;
    }

    /// Returns the number of batches waiting to be flushed.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.batches
    }

    /// Returns the number of buffered rows.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.buffers.iter().map(LoadBuffer::len).sum()
    }

    /// Writes every buffer in load order, then clears them.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::Store`] when a write fails. Rows written by earlier
    /// loads in the same flush stay written.
    pub async fn flush(&mut self) -> Result<FlushOutcome, EtlError> {
        let mut stats = WriteStats::default();
        let order: Vec<usize> = self.step.load_order().collect();
        for i in order {
            let load = Arc::clone(&self.step.loads()[i]);
            let buffer = &mut self.buffers[i];
            if buffer.is_empty() {
                continue;
            }
            let written = write_with_fallback(
                self.target.as_ref(),
                &load,
                buffer,
                self.fk_retry_limit,
            )
            .await?;
            tracing::debug!(
                step = %self.step.name(),
                load = %load.name(),
                table = %load.entity().qualified_name(),
                rows = buffer.len(),
                inserted = written.inserted,
                updated = written.updated,
                dropped = written.dropped,
                "Flushed load buffer"
            );
            stats.absorb(written);
            buffer.clear();
        }

        let outcome = FlushOutcome {
            stats,
            processed: std::mem::take(&mut self.processed),
            batches: std::mem::take(&mut self.batches),
        };
        Ok(outcome)
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("step", &self.step.name())
            .field("buffered_rows", &self.buffered_rows())
            .field("pending_batches", &self.batches)
            .finish_non_exhaustive()
    }
}

/// Writes one buffer, dropping rows with dangling foreign keys up to
/// `retry_limit` times before giving up.
async fn write_with_fallback(
    target: &dyn TargetStore,
    load: &LoadNode,
    buffer: &mut LoadBuffer,
    retry_limit: usize,
) -> Result<WriteStats, EtlError> {
    let mut dropped = 0u64;
    let mut attempts = 0usize;
    loop {
        match target
            .bulk_write(load.entity(), load.columns(), buffer.rows(), load.mode())
            .await
        {
            Ok(mut stats) => {
                stats.dropped += dropped;
                return Ok(stats);
            }
            Err(StoreError::ForeignKeyViolation { table, column, value }) if attempts < retry_limit => {
                attempts += 1;
                let Some(position) = load.columns().iter().position(|c| *c == column) else {
                    return Err(StoreError::ForeignKeyViolation { table, column, value }.into());
                };
                let removed = buffer.retain(|row| !cell_matches(row, position, &value));
                if removed == 0 {
                    return Err(StoreError::ForeignKeyViolation { table, column, value }.into());
                }
                tracing::warn!(
                    load = %load.name(),
                    table = %table,
                    column = %column,
                    value = %value,
                    removed,
                    attempt = attempts,
                    "Dropping rows with dangling foreign key"
                );
                dropped += removed as u64;
                if buffer.is_empty() {
                    return Ok(WriteStats {
                        dropped,
                        ..WriteStats::default()
                    });
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn cell_matches(row: &PreparedRow, position: usize, value: &str) -> bool {
    match row.values.get(position) {
        Some(Value::String(text)) => text == value,
        Some(Value::Null) | None => false,
        Some(other) => other.to_string() == value,
    }
}
