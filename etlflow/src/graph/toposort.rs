//! Deterministic topological ordering shared by step and run graphs.

use crate::errors::CycleDetectedError;
use std::collections::{BTreeSet, HashSet};

/// Orders nodes `0..names.len()` so every node follows its dependencies.
///
/// `deps[i]` lists the indices node `i` depends on. Among ready nodes the
/// one discovered first (lowest index) runs first, so the same graph always
/// yields the same order.
///
/// # Errors
///
/// Returns a [`CycleDetectedError`] naming one cycle.
pub fn stable_toposort(names: &[String], deps: &[Vec<usize>]) -> Result<Vec<usize>, CycleDetectedError> {
    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        let unique: BTreeSet<usize> = node_deps.iter().copied().collect();
        in_degree[node] = unique.len();
        for dep in unique {
            dependents[dep].push(node);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let placed: HashSet<usize> = order.into_iter().collect();
    let remaining: Vec<usize> = (0..n).filter(|i| !placed.contains(i)).collect();
    let cycle = find_cycle(&remaining, deps)
        .unwrap_or(remaining)
        .into_iter()
        .map(|i| names[i].clone())
        .collect();
    Err(CycleDetectedError::new(cycle))
}

fn find_cycle(start: &[usize], deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn dfs(
        node: usize,
        deps: &[Vec<usize>],
        visited: &mut HashSet<usize>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited.insert(node);
        stack.push(node);
        for &dep in &deps[node] {
            if let Some(pos) = stack.iter().position(|n| *n == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep);
                return Some(cycle);
            }
            if !visited.contains(&dep) {
                if let Some(cycle) = dfs(dep, deps, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }

    let mut visited = HashSet::new();
    for &node in start {
        if !visited.contains(&node) {
            let mut stack = Vec::new();
            if let Some(cycle) = dfs(node, deps, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("n{i}")).collect()
    }

    #[test]
    fn test_ties_broken_by_discovery_order() {
        // n2 depends on n0; n1 and n2 are both ready after n0.
        let order = stable_toposort(&names(4), &[vec![], vec![], vec![0], vec![1, 2]]).unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);

        let order = stable_toposort(&names(3), &[vec![2], vec![], vec![]]).unwrap();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_cycle_reported_with_path() {
        let err = stable_toposort(&names(3), &[vec![], vec![2], vec![1]]).unwrap_err();
        assert_eq!(err.cycle_path.first(), err.cycle_path.last());
        assert!(err.cycle_path.contains(&"n1".to_string()));
        assert!(!err.cycle_path.contains(&"n0".to_string()));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let order = stable_toposort(&names(2), &[vec![], vec![0, 0]]).unwrap();
        assert_eq!(order, vec![0, 1]);
    }
}
