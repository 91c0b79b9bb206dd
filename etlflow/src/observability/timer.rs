//! Wall-clock timing for stages and steps.

use std::time::Instant;

/// Measures the duration of a named span of work.
#[derive(Debug, Clone)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logs the elapsed time at debug level and returns it.
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::debug!(span = %self.name, elapsed_ms = elapsed, "Span finished");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("flush");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "flush");
        assert!(timer.finish() >= 10.0);
    }
}
