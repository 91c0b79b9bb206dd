//! Lifecycle events emitted by the engine.
//!
//! The engine owns one [`EventSink`]; there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// A run started.
pub const RUN_STARTED: &str = "run.started";
/// A run reached a terminal status.
pub const RUN_COMPLETED: &str = "run.completed";
/// A step started running.
pub const STEP_STARTED: &str = "step.started";
/// A step completed.
pub const STEP_COMPLETED: &str = "step.completed";
/// A step failed.
pub const STEP_FAILED: &str = "step.failed";
/// A step was filtered out.
pub const STEP_EXCLUDED: &str = "step.excluded";
/// A step was skipped after an upstream failure.
pub const STEP_UPSTREAM_FAILED: &str = "step.upstream_failed";
/// The loader flushed buffered rows.
pub const BATCH_FLUSHED: &str = "batch.flushed";
/// The memory sampler took a sample.
pub const MEMORY_SAMPLED: &str = "memory.sampled";
