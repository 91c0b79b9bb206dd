//! Core value and status types shared across the engine.

mod output;
mod status;

pub use output::{NodeOutput, Row};
pub use status::{NodeKind, RunStatus, StepRunStatus};
