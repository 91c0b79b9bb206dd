//! Failure propagation between steps of one run.

use crate::errors::EtlError;
use crate::graph::{Dependency, EtlStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens to later steps when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Every step after the failure is marked upstream-failed.
    FailFast,
    /// Steps needing what a failed step yields are marked upstream-failed,
    /// transitively; the rest run.
    #[default]
    ExcludeDownstream,
    /// Later steps run regardless.
    Continue,
}

/// A recorded step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Step name.
    pub step: String,
    /// Error message.
    pub error: String,
    /// Error kind.
    pub error_type: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Tracks failed steps and decides which later steps are blocked.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    policy: FailurePolicy,
    blocking: Vec<(String, Dependency)>,
    records: Vec<FailureRecord>,
}

impl FailureTracker {
    /// Creates a tracker for `policy`.
    #[must_use]
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            blocking: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Records a step that ran and failed.
    pub fn record_failure(&mut self, step: &EtlStep, error: &EtlError) {
        self.records.push(FailureRecord {
            step: step.name().to_string(),
            error: error.to_string(),
            error_type: error.kind().to_string(),
            timestamp: Utc::now(),
        });
        self.blocking
            .push((step.name().to_string(), step.dependency().clone()));
    }

    /// Records a step skipped because of an upstream failure, so its own
    /// dependents are skipped too.
    pub fn record_upstream_failure(&mut self, step: &EtlStep) {
        self.blocking
            .push((step.name().to_string(), step.dependency().clone()));
    }

    /// Returns the failed step that blocks `step`, if any.
    #[must_use]
    pub fn blocked_by(&self, step: &EtlStep) -> Option<&str> {
        match self.policy {
            FailurePolicy::FailFast => self.blocking.first().map(|(name, _)| name.as_str()),
            FailurePolicy::ExcludeDownstream => self
                .blocking
                .iter()
                .find(|(_, failed)| Dependency::test(step.dependency(), failed))
                .map(|(name, _)| name.as_str()),
            FailurePolicy::Continue => None,
        }
    }

    /// Returns the failures recorded so far.
    #[must_use]
    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    /// Returns the number of steps that ran and failed.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.records.len()
    }

    /// Returns true when any step failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeOutput;
    use crate::graph::{ExtractNode, IterExtract};

    fn step(name: &str, dependency: Dependency) -> EtlStep {
        let extract = ExtractNode::builder(format!("{name}_source"))
            .outputs(["v"])
            .build(IterExtract::from_rows(name, vec![NodeOutput::scalar(1)]))
            .unwrap();
        EtlStep::builder(name)
            .extract(extract)
            .dependency(dependency)
            .build()
            .unwrap()
    }

    fn failure() -> EtlError {
        EtlError::Extract("source offline".to_string())
    }

    #[test]
    fn test_fail_fast_blocks_everything() {
        let a = step("a", Dependency::new().yields_table("x"));
        let unrelated = step("b", Dependency::new());

        let mut tracker = FailureTracker::new(FailurePolicy::FailFast);
        assert_eq!(tracker.blocked_by(&unrelated), None);
        tracker.record_failure(&a, &failure());
        assert_eq!(tracker.blocked_by(&unrelated), Some("a"));
        assert_eq!(tracker.failure_count(), 1);
        assert_eq!(tracker.records()[0].error_type, "ExtractError");
    }

    #[test]
    fn test_exclude_downstream_is_transitive() {
        let a = step("a", Dependency::new().yields_table("x"));
        let b = step("b", Dependency::new().needs_table("x").yields_table("y"));
        let c = step("c", Dependency::new().needs_table("y"));
        let d = step("d", Dependency::new().needs_table("z"));

        let mut tracker = FailureTracker::new(FailurePolicy::ExcludeDownstream);
        tracker.record_failure(&a, &failure());

        assert_eq!(tracker.blocked_by(&b), Some("a"));
        tracker.record_upstream_failure(&b);
        assert_eq!(tracker.blocked_by(&c), Some("b"));
        assert_eq!(tracker.blocked_by(&d), None);
        assert_eq!(tracker.failure_count(), 1);
    }

    #[test]
    fn test_continue_blocks_nothing() {
        let a = step("a", Dependency::new().yields_table("x"));
        let b = step("b", Dependency::new().needs_table("x"));

        let mut tracker = FailureTracker::new(FailurePolicy::Continue);
        tracker.record_failure(&a, &failure());
        assert_eq!(tracker.blocked_by(&b), None);
        assert!(tracker.has_failures());
    }

    #[test]
    fn test_policy_serde_names() {
        let json = serde_json::to_string(&FailurePolicy::ExcludeDownstream).unwrap();
        assert_eq!(json, "\"exclude_downstream\"");
        assert_eq!(FailurePolicy::default(), FailurePolicy::ExcludeDownstream);
    }
}
