//! Needs/yields descriptors used to order steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tables and columns a node or step needs and yields.
///
/// `Dependency::test(a, b)` is true when `a` needs something `b` yields.
/// Values are built once and never mutated afterwards; `merge` returns a new
/// value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    tables_needed: BTreeSet<String>,
    columns_needed: BTreeSet<String>,
    tables_yielded: BTreeSet<String>,
    columns_yielded: BTreeSet<String>,
}

impl Dependency {
    /// Creates an empty dependency.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a needed table.
    #[must_use]
    pub fn needs_table(mut self, table: impl Into<String>) -> Self {
        self.tables_needed.insert(table.into());
        self
    }

    /// Adds a needed column (`table.column`).
    #[must_use]
    pub fn needs_column(mut self, column: impl Into<String>) -> Self {
        self.columns_needed.insert(column.into());
        self
    }

    /// Adds a yielded table.
    #[must_use]
    pub fn yields_table(mut self, table: impl Into<String>) -> Self {
        self.tables_yielded.insert(table.into());
        self
    }

    /// Adds a yielded column (`table.column`).
    #[must_use]
    pub fn yields_column(mut self, column: impl Into<String>) -> Self {
        self.columns_yielded.insert(column.into());
        self
    }

    /// Returns the needed tables.
    #[must_use]
    pub fn tables_needed(&self) -> &BTreeSet<String> {
        &self.tables_needed
    }

    /// Returns the needed columns.
    #[must_use]
    pub fn columns_needed(&self) -> &BTreeSet<String> {
        &self.columns_needed
    }

    /// Returns the yielded tables.
    #[must_use]
    pub fn tables_yielded(&self) -> &BTreeSet<String> {
        &self.tables_yielded
    }

    /// Returns the yielded columns.
    #[must_use]
    pub fn columns_yielded(&self) -> &BTreeSet<String> {
        &self.columns_yielded
    }

    /// True when `a` needs a table or column that `b` yields.
    #[must_use]
    pub fn test(a: &Self, b: &Self) -> bool {
        !a.tables_needed.is_disjoint(&b.tables_yielded)
            || !a.columns_needed.is_disjoint(&b.columns_yielded)
    }

    /// Pairwise union of all four sets.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            tables_needed: self.tables_needed.union(&other.tables_needed).cloned().collect(),
            columns_needed: self.columns_needed.union(&other.columns_needed).cloned().collect(),
            tables_yielded: self.tables_yielded.union(&other.tables_yielded).cloned().collect(),
            columns_yielded: self
                .columns_yielded
                .union(&other.columns_yielded)
                .cloned()
                .collect(),
        }
    }

    /// Merges any number of dependencies.
    #[must_use]
    pub fn merge_all<'a>(deps: impl IntoIterator<Item = &'a Self>) -> Self {
        deps.into_iter()
            .fold(Self::default(), |acc, dep| acc.merge(dep))
    }

    /// Returns true when all four sets are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables_needed.is_empty()
            && self.columns_needed.is_empty()
            && self.tables_yielded.is_empty()
            && self.columns_yielded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yields_x() -> Dependency {
        Dependency::new().yields_table("x").yields_column("x.id")
    }

    #[test]
    fn test_overlap_on_tables() {
        let needs = Dependency::new().needs_table("x");
        assert!(Dependency::test(&needs, &yields_x()));
        assert!(!Dependency::test(&yields_x(), &needs));
    }

    #[test]
    fn test_overlap_on_columns() {
        let needs = Dependency::new().needs_column("x.id");
        assert!(Dependency::test(&needs, &yields_x()));

        let other = Dependency::new().needs_column("x.name");
        assert!(!Dependency::test(&other, &yields_x()));
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let a = Dependency::new().needs_table("a").yields_column("a.c");
        let b = Dependency::new().yields_table("b");
        let c = Dependency::new().needs_column("c.d").needs_table("a");

        assert_eq!(a.merge(&b), b.merge(&a));
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        assert_eq!(Dependency::merge_all([&a, &b, &c]), a.merge(&b).merge(&c));
    }

    #[test]
    fn test_empty() {
        assert!(Dependency::new().is_empty());
        assert!(!yields_x().is_empty());
        assert!(!Dependency::test(&Dependency::new(), &yields_x()));
    }
}
