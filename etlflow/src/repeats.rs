//! Tracking of already-processed inputs per step.

use crate::store::MetadataStore;
use crate::errors::StoreError;
use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RepeatSets {
    /// Persisted hashes.
    old: HashSet<Uuid>,
    /// Processed this run, not yet persisted.
    new: HashSet<Uuid>,
    /// Admitted and in flight.
    pending: HashSet<Uuid>,
}

/// Input hashes a step has already processed.
///
/// An input is a repeat when its hash is persisted, processed this run, or
/// currently in flight. Sets never shrink within a run; hashes only move
/// from `pending` to `new` to `old`.
#[derive(Debug)]
pub struct RepeatTracker {
    step_id: Uuid,
    retry: bool,
    sets: Mutex<RepeatSets>,
}

impl RepeatTracker {
    /// Creates a tracker seeded with persisted hashes.
    #[must_use]
    pub fn new(step_id: Uuid, persisted: HashSet<Uuid>, retry: bool) -> Self {
        Self {
            step_id,
            retry,
            sets: Mutex::new(RepeatSets {
                old: persisted,
                ..RepeatSets::default()
            }),
        }
    }

    /// Loads the persisted hashes of a step.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures.
    pub async fn load(
        store: &dyn MetadataStore,
        step_id: Uuid,
        retry: bool,
    ) -> Result<Self, StoreError> {
        let persisted = store.load_repeats(step_id).await?;
        tracing::debug!(step_id = %step_id, repeats = persisted.len(), retry, "Loaded repeats");
        Ok(Self::new(step_id, persisted, retry))
    }

    /// Returns the step this tracker belongs to.
    #[must_use]
    pub fn step_id(&self) -> Uuid {
        self.step_id
    }

    /// Returns true when every input is reprocessed.
    #[must_use]
    pub fn retry(&self) -> bool {
        self.retry
    }

    /// Decides whether an input should be processed, marking it in flight.
    ///
    /// With `retry` every input is admitted; the hash is still recorded.
    pub fn admit(&self, hash: Uuid) -> bool {
        let mut sets = self.sets.lock();
        if !self.retry
            && (sets.old.contains(&hash) || sets.new.contains(&hash) || sets.pending.contains(&hash))
        {
            return false;
        }
        sets.pending.insert(hash);
        true
    }

    /// Returns true when `hash` is known in any set.
    #[must_use]
    pub fn is_repeat(&self, hash: &Uuid) -> bool {
        let sets = self.sets.lock();
        sets.old.contains(hash) || sets.new.contains(hash) || sets.pending.contains(hash)
    }

    /// Moves flushed inputs from in flight to processed.
    pub fn complete(&self, hashes: &[Uuid]) {
        let mut sets = self.sets.lock();
        for hash in hashes {
            sets.pending.remove(hash);
            sets.new.insert(*hash);
        }
    }

    /// Folds persisted hashes into the persisted set.
    pub fn fold(&self, hashes: &[Uuid]) {
        let mut sets = self.sets.lock();
        for hash in hashes {
            if sets.new.remove(hash) {
                sets.old.insert(*hash);
            }
        }
    }

    /// Persists hashes and folds them.
    ///
    /// # Errors
    ///
    /// Propagates metadata store failures; the hashes stay unpersisted.
    pub async fn persist(&self, store: &dyn MetadataStore, hashes: &[Uuid]) -> Result<(), StoreError> {
        if hashes.is_empty() {
            return Ok(());
        }
        store.persist_repeats(self.step_id, hashes).await?;
        self.fold(hashes);
        Ok(())
    }

    /// Returns `(old, new, pending)` set sizes.
    #[must_use]
    pub fn sizes(&self) -> (usize, usize, usize) {
        let sets = self.sets.lock();
        (sets.old.len(), sets.new.len(), sets.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetadataStore;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn test_repeats_skipped() {
        let tracker = RepeatTracker::new(id(0), HashSet::from([id(1)]), false);
        assert!(!tracker.admit(id(1)));
        assert!(tracker.admit(id(2)));
        // Still in flight, so a duplicate is a repeat.
        assert!(!tracker.admit(id(2)));
        assert_eq!(tracker.sizes(), (1, 0, 1));
    }

    #[test]
    fn test_retry_admits_everything() {
        let tracker = RepeatTracker::new(id(0), HashSet::from([id(1)]), true);
        assert!(tracker.admit(id(1)));
        assert!(tracker.admit(id(1)));
        assert!(tracker.is_repeat(&id(1)));
    }

    #[tokio::test]
    async fn test_lifecycle_through_store() {
        let store = MemoryMetadataStore::new();
        let tracker = RepeatTracker::load(&store, id(0), false).await.unwrap();

        assert!(tracker.admit(id(5)));
        tracker.complete(&[id(5)]);
        assert_eq!(tracker.sizes(), (0, 1, 0));
        tracker.persist(&store, &[id(5)]).await.unwrap();
        assert_eq!(tracker.sizes(), (1, 0, 0));

        let reloaded = RepeatTracker::load(&store, id(0), false).await.unwrap();
        assert!(!reloaded.admit(id(5)));
    }
}
