//! Per-load row buffer keyed by primary key.

use super::PreparedRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Rows waiting for the next flush of one load.
///
/// A row whose key is already buffered replaces the earlier row but keeps
/// its arrival position.
#[derive(Debug, Default, Clone)]
pub struct LoadBuffer {
    index: HashMap<Uuid, usize>,
    rows: Vec<PreparedRow>,
}

impl LoadBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a row; last write wins.
    pub fn push(&mut self, row: PreparedRow) {
        match self.index.get(&row.key) {
            Some(&position) => self.rows[position] = row,
            None => {
                self.index.insert(row.key, self.rows.len());
                self.rows.push(row);
            }
        }
    }

    /// Buffers several rows.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = PreparedRow>) {
        for row in rows {
            self.push(row);
        }
    }

    /// Returns the number of distinct keys buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns buffered rows in arrival order.
    #[must_use]
    pub fn rows(&self) -> &[PreparedRow] {
        &self.rows
    }

    /// Removes rows for which `keep` returns false; returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&PreparedRow) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row));
        self.reindex();
        before - self.rows.len()
    }

    /// Empties the buffer.
    pub fn clear(&mut self) {
        self.index.clear();
        self.rows.clear();
    }

    fn reindex(&mut self) {
        self.index = self
            .rows
            .iter()
            .enumerate()
            .map(|(position, row)| (row.key, position))
            .collect();
    }
}
