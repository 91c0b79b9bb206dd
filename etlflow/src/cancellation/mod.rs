//! Cooperative cancellation for runs and pipeline stages.
//!
//! - [`CancellationToken`] carries the cancel flag, the first reason and an
//!   awaitable notification.
//! - [`StructuredTaskGroup`] runs related stage tasks; the first failure
//!   cancels the rest.

mod task_group;
mod token;

pub use task_group::StructuredTaskGroup;
pub use token::CancellationToken;
