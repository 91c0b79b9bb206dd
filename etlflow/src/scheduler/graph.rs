//! Cross-step dependency graph.

use crate::errors::CycleDetectedError;
use crate::graph::toposort::stable_toposort;
use crate::graph::{Dependency, EtlStep};
use std::sync::Arc;

/// Steps ordered so that every step runs after the steps yielding what it
/// needs.
///
/// Step `b` depends on step `a` when `Dependency::test(b, a)`. A step that
/// needs what it yields itself does not depend on itself.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    upstream: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the graph over `steps`, in model order.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleDetectedError`] when steps depend on each other in a
    /// loop.
    pub fn build(steps: &[Arc<EtlStep>]) -> Result<Self, CycleDetectedError> {
        let deps: Vec<&Dependency> = steps.iter().map(|s| s.dependency()).collect();
        Self::from_dependencies(steps.iter().map(|s| s.name().to_string()).collect(), &deps)
    }

    /// Builds the graph from names and dependencies directly.
    ///
    /// # Errors
    ///
    /// Returns a [`CycleDetectedError`] for cyclic dependencies.
    pub fn from_dependencies(names: Vec<String>, deps: &[&Dependency]) -> Result<Self, CycleDetectedError> {
        let upstream: Vec<Vec<usize>> = deps
            .iter()
            .enumerate()
            .map(|(b, needs)| {
                deps.iter()
                    .enumerate()
                    .filter(|(a, yields)| *a != b && Dependency::test(needs, yields))
                    .map(|(a, _)| a)
                    .collect()
            })
            .collect();
        let order = stable_toposort(&names, &upstream)?;
        Ok(Self {
            names,
            upstream,
            order,
        })
    }

    /// Returns step indices in execution order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Returns step names in execution order.
    #[must_use]
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.names[i].as_str()).collect()
    }

    /// Returns the steps `index` directly depends on.
    #[must_use]
    pub fn upstream(&self, index: usize) -> &[usize] {
        self.upstream.get(index).map_or(&[], Vec::as_slice)
    }

    /// Returns every step that depends on `index`, directly or not.
    #[must_use]
    pub fn downstream(&self, index: usize) -> Vec<usize> {
        let mut found = vec![false; self.names.len()];
        let mut stack = vec![index];
        while let Some(node) = stack.pop() {
            for (candidate, ups) in self.upstream.iter().enumerate() {
                if !found[candidate] && ups.contains(&node) {
                    found[candidate] = true;
                    stack.push(candidate);
                }
            }
        }
        self.order.iter().copied().filter(|&i| found[i]).collect()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true when the graph has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_reader_follows_writer_in_either_declaration_order() {
        let writer = Dependency::new().yields_table("x");
        let reader = Dependency::new().needs_table("x");

        let graph = DependencyGraph::from_dependencies(names(&["b", "a"]), &[&reader, &writer]).unwrap();
        assert_eq!(graph.ordered_names(), vec!["a", "b"]);

        let graph = DependencyGraph::from_dependencies(names(&["a", "b"]), &[&writer, &reader]).unwrap();
        assert_eq!(graph.ordered_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_independent_steps_keep_model_order() {
        let empty = Dependency::new();
        let graph =
            DependencyGraph::from_dependencies(names(&["c", "a", "b"]), &[&empty, &empty, &empty]).unwrap();
        assert_eq!(graph.ordered_names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_self_dependency_is_ignored() {
        let rewrite = Dependency::new().needs_table("x").yields_table("x");
        let graph = DependencyGraph::from_dependencies(names(&["rewrite"]), &[&rewrite]).unwrap();
        assert_eq!(graph.ordered_names(), vec!["rewrite"]);
    }

    #[test]
    fn test_mutual_dependency_is_a_cycle() {
        let a = Dependency::new().needs_table("y").yields_table("x");
        let b = Dependency::new().needs_table("x").yields_table("y");
        let err = DependencyGraph::from_dependencies(names(&["a", "b"]), &[&a, &b]).unwrap_err();
        assert_eq!(err.cycle_path.len(), 3);
    }

    #[test]
    fn test_downstream_is_transitive() {
        let a = Dependency::new().yields_table("x");
        let b = Dependency::new().needs_table("x").yields_column("y.id");
        let c = Dependency::new().needs_column("y.id");
        let d = Dependency::new();
        let graph =
            DependencyGraph::from_dependencies(names(&["a", "b", "c", "d"]), &[&a, &b, &c, &d]).unwrap();

        assert_eq!(graph.downstream(0), vec![1, 2]);
        assert_eq!(graph.upstream(2), &[1]);
        assert!(graph.downstream(3).is_empty());
    }
}
