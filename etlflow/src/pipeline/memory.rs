//! Periodic sampling of process memory.

use super::StepCounters;
use crate::cancellation::CancellationToken;
use crate::events::{EventSink, MEMORY_SAMPLED};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reads the resident memory of the current process.
///
/// Workers are threads of this process, so their usage is included.
pub struct MemorySampler {
    system: System,
    pid: Pid,
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler {
    /// Creates a sampler for the current process.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Refreshes and returns resident memory in bytes.
    pub fn sample(&mut self) -> u64 {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system.process(self.pid).map_or(0, sysinfo::Process::memory)
    }

    /// Samples every `interval` into `counters` until `token` is cancelled.
    pub async fn run(
        mut self,
        step: String,
        interval: Duration,
        counters: Arc<StepCounters>,
        events: Arc<dyn EventSink>,
        token: Arc<CancellationToken>,
    ) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let bytes = self.sample();
                    counters.record_memory(bytes);
                    tracing::trace!(step = %step, rss_bytes = bytes, "Memory sampled");
                    events.try_emit(MEMORY_SAMPLED, Some(json!({"step": step, "rss_bytes": bytes})));
                }
            }
        }
    }
}

impl std::fmt::Debug for MemorySampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySampler").field("pid", &self.pid).finish_non_exhaustive()
    }
}
