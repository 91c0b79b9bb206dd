//! Node kinds and run/step-run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a node plays in a step's graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces raw rows from a source.
    Extract,
    /// Pure function over resolved inputs.
    Transform,
    /// Writes rows into the target store.
    Load,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extract => write!(f, "extract"),
            Self::Transform => write!(f, "transform"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Status of a single step within a run.
///
/// `initialized -> (excluded | upstream_failed | running -> (completed | failed))`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    /// Created, not yet scheduled.
    #[default]
    Initialized,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Filtered out by include/exclude/start/until.
    Excluded,
    /// Skipped because a step it depends on failed.
    UpstreamFailed,
}

impl StepRunStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Excluded | Self::UpstreamFailed
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Initialized => matches!(
                next,
                Self::Running | Self::Excluded | Self::UpstreamFailed
            ),
            Self::Running => matches!(next, Self::Completed | Self::Failed),
            _ => false,
        }
    }

    /// Returns the persisted text form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Excluded => "excluded",
            Self::UpstreamFailed => "upstream_failed",
        }
    }

    /// Parses the persisted text form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "initialized" => Some(Self::Initialized),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "excluded" => Some(Self::Excluded),
            "upstream_failed" => Some(Self::UpstreamFailed),
            _ => None,
        }
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole run.
///
/// `initialized -> running -> (completed | failed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet started.
    #[default]
    Initialized,
    /// Steps are executing.
    Running,
    /// Every executed step completed.
    Completed,
    /// At least one step failed.
    Failed,
}

impl RunStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns the persisted text form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the persisted text form.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "initialized" => Some(Self::Initialized),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_run_transitions() {
        use StepRunStatus::*;
        assert!(Initialized.can_transition_to(Running));
        assert!(Initialized.can_transition_to(Excluded));
        assert!(Initialized.can_transition_to(UpstreamFailed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Initialized.can_transition_to(Completed));
    }

    #[test]
    fn test_step_run_terminal() {
        assert!(StepRunStatus::UpstreamFailed.is_terminal());
        assert!(!StepRunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_text_roundtrip() {
        for status in [
            StepRunStatus::Initialized,
            StepRunStatus::UpstreamFailed,
            StepRunStatus::Excluded,
        ] {
            assert_eq!(StepRunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("completed"), Some(RunStatus::Completed));
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&StepRunStatus::UpstreamFailed).unwrap();
        assert_eq!(json, r#""upstream_failed""#);
        assert_eq!(NodeKind::Load.to_string(), "load");
    }
}
