//! Logging setup and timing helpers.

mod logging;
mod timer;

pub use logging::{build_filter, init_logging};
pub use timer::SpanTimer;
