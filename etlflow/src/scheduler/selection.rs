//! Narrowing a run to a subset of steps.

use crate::config::RunConfig;
use crate::errors::ValidationError;
use crate::graph::EtlStep;

/// Why a step does not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// Not matched by any include selector.
    NotIncluded,
    /// Matched by an exclude selector.
    Excluded(String),
    /// Ordered before the start step.
    BeforeStart,
    /// Ordered after the until step.
    AfterUntil,
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotIncluded => write!(f, "not included"),
            Self::Excluded(selector) => write!(f, "excluded by '{selector}'"),
            Self::BeforeStart => write!(f, "before start step"),
            Self::AfterUntil => write!(f, "after until step"),
        }
    }
}

fn matches(step: &EtlStep, selector: &str) -> bool {
    step.name() == selector || step.has_tag(selector)
}

/// Decides, for steps already in execution order, which of them run.
///
/// Exclusion wins over inclusion. `start` and `until` are step names and
/// bound the run inclusively.
///
/// # Errors
///
/// Returns a [`ValidationError`] when `start` or `until` names no step, or
/// `until` comes before `start`.
pub fn select(ordered: &[&EtlStep], config: &RunConfig) -> Result<Vec<Option<Exclusion>>, ValidationError> {
    let position = |name: &str, field: &str| {
        ordered.iter().position(|s| s.name() == name).ok_or_else(|| {
            ValidationError::new(format!("Unknown {field} step '{name}'")).with_nodes(vec![name.to_string()])
        })
    };
    let start = config.start.as_deref().map(|n| position(n, "start")).transpose()?;
    let until = config.until.as_deref().map(|n| position(n, "until")).transpose()?;
    if let (Some(start), Some(until)) = (start, until) {
        if until < start {
            return Err(ValidationError::new(format!(
                "Until step '{}' is ordered before start step '{}'",
                ordered[until].name(),
                ordered[start].name()
            )));
        }
    }

    for selector in config.include.iter().chain(&config.exclude) {
        if !ordered.iter().any(|s| matches(s, selector)) {
            tracing::warn!(selector = %selector, "Step selector matches no step");
        }
    }

    Ok(ordered
        .iter()
        .enumerate()
        .map(|(i, step)| {
            if let Some(selector) = config.exclude.iter().find(|sel| matches(step, sel)) {
                Some(Exclusion::Excluded(selector.clone()))
            } else if !config.include.is_empty() && !config.include.iter().any(|sel| matches(step, sel)) {
                Some(Exclusion::NotIncluded)
            } else if start.is_some_and(|s| i < s) {
                Some(Exclusion::BeforeStart)
            } else if until.is_some_and(|u| i > u) {
                Some(Exclusion::AfterUntil)
            } else {
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeOutput;
    use crate::graph::{AttrType, ComputationalNode, ExtractNode, IterExtract, LoadEntity, LoadNode};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn step(name: &str, tags: &[&str]) -> EtlStep {
        let extract = ExtractNode::builder(format!("{name}_source"))
            .outputs(["v"])
            .build(IterExtract::from_rows(name, vec![NodeOutput::scalar(1)]))
            .unwrap();
        let entity = Arc::new(
            LoadEntity::builder(format!("{name}_table"))
                .identifying_attribute("v", AttrType::Integer)
                .build()
                .unwrap(),
        );
        let load = LoadNode::builder("write", entity)
            .input("v", extract.output("v").unwrap())
            .build()
            .unwrap();
        let mut builder = EtlStep::builder(name).extract(extract).load(load);
        for tag in tags {
            builder = builder.tag(*tag);
        }
        builder.build().unwrap()
    }

    fn running(result: &[Option<Exclusion>]) -> Vec<bool> {
        result.iter().map(Option::is_none).collect()
    }

    #[test]
    fn test_everything_runs_by_default() {
        let (a, b) = (step("a", &[]), step("b", &[]));
        let result = select(&[&a, &b], &RunConfig::new()).unwrap();
        assert_eq!(running(&result), vec![true, true]);
    }

    #[test]
    fn test_include_by_name_or_tag() {
        let (a, b, c) = (step("a", &["nightly"]), step("b", &[]), step("c", &["nightly"]));
        let result = select(&[&a, &b, &c], &RunConfig::new().include("nightly")).unwrap();
        assert_eq!(running(&result), vec![true, false, true]);
        assert_eq!(result[1], Some(Exclusion::NotIncluded));

        let result = select(&[&a, &b, &c], &RunConfig::new().include("b")).unwrap();
        assert_eq!(running(&result), vec![false, true, false]);
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let (a, b) = (step("a", &["core"]), step("b", &["core"]));
        let config = RunConfig::new().include("core").exclude("b");
        let result = select(&[&a, &b], &config).unwrap();
        assert_eq!(result, vec![None, Some(Exclusion::Excluded("b".to_string()))]);
    }

    #[test]
    fn test_start_and_until_bound_the_run() {
        let steps: Vec<EtlStep> = ["a", "b", "c", "d"].iter().map(|n| step(n, &[])).collect();
        let ordered: Vec<&EtlStep> = steps.iter().collect();

        let result = select(&ordered, &RunConfig::new().start("b").until("c")).unwrap();
        assert_eq!(running(&result), vec![false, true, true, false]);
        assert_eq!(result[0], Some(Exclusion::BeforeStart));
        assert_eq!(result[3], Some(Exclusion::AfterUntil));
    }

    #[test]
    fn test_bad_bounds_are_rejected() {
        let (a, b) = (step("a", &[]), step("b", &[]));
        assert!(select(&[&a, &b], &RunConfig::new().start("zzz")).is_err());
        assert!(select(&[&a, &b], &RunConfig::new().start("b").until("a")).is_err());
    }
}
