//! In-memory stores for tests and dry runs.

use super::{MetadataStore, RunEntity, StepRecord, StepRunEntity, TargetStore};
use crate::errors::StoreError;
use crate::graph::{LoadEntity, PreparedRow, WriteMode, WriteStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

type MemoryRow = BTreeMap<String, Value>;

/// A target store backed by hash maps.
///
/// Optionally enforces foreign keys, and can be told to fail the next write
/// to a table.
#[derive(Debug, Default)]
pub struct MemoryTargetStore {
    tables: Mutex<HashMap<String, BTreeMap<Uuid, MemoryRow>>>,
    failures: Mutex<HashMap<String, VecDeque<StoreError>>>,
    enforce_foreign_keys: AtomicBool,
    writes: AtomicU64,
}

impl MemoryTargetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects rows whose foreign keys reference absent parent keys.
    #[must_use]
    pub fn with_foreign_key_checks(self) -> Self {
        self.enforce_foreign_keys.store(true, Ordering::SeqCst);
        self
    }

    /// Makes the next write to `table` fail with `error`.
    pub fn fail_next_write(&self, table: impl Into<String>, error: StoreError) {
        self.failures
            .lock()
            .entry(table.into())
            .or_default()
            .push_back(error);
    }

    /// Returns a copy of a table's rows, by key.
    #[must_use]
    pub fn rows(&self, table: &str) -> BTreeMap<Uuid, MemoryRow> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Returns the number of successful `bulk_write` calls.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_foreign_keys(
        tables: &HashMap<String, BTreeMap<Uuid, MemoryRow>>,
        entity: &LoadEntity,
        columns: &[String],
        rows: &[PreparedRow],
    ) -> Result<(), StoreError> {
        let own_keys: HashSet<Uuid> = rows.iter().map(|r| r.key).collect();
        for (position, column) in columns.iter().enumerate() {
            let Some(references) = entity.foreign_keys().get(column) else {
                continue;
            };
            let parent = tables.get(references);
            for row in rows {
                let Some(text) = row.values.get(position).and_then(Value::as_str) else {
                    continue;
                };
                let present = Uuid::parse_str(text).is_ok_and(|key| {
                    parent.is_some_and(|p| p.contains_key(&key))
                        || (references == entity.table() && own_keys.contains(&key))
                });
                if !present {
                    return Err(StoreError::ForeignKeyViolation {
                        table: entity.qualified_name(),
                        column: column.clone(),
                        value: text.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn bulk_write(
        &self,
        entity: &LoadEntity,
        columns: &[String],
        rows: &[PreparedRow],
        mode: WriteMode,
    ) -> Result<WriteStats, StoreError> {
        let name = entity.qualified_name();
        if let Some(err) = self
            .failures
            .lock()
            .get_mut(&name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let mut tables = self.tables.lock();
        if self.enforce_foreign_keys.load(Ordering::SeqCst) {
            Self::check_foreign_keys(&tables, entity, columns, rows)?;
        }

        let table = tables.entry(name).or_default();
        let mut stats = WriteStats::default();
        for row in rows {
            let values = columns.iter().cloned().zip(row.values.iter().cloned());
            if let Some(existing) = table.get_mut(&row.key) {
                existing.extend(values);
                stats.updated += 1;
            } else if mode == WriteMode::Insert {
                table.insert(row.key, values.collect());
                stats.inserted += 1;
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stats)
    }

    async fn row_count(&self, entity: &LoadEntity) -> Result<u64, StoreError> {
        Ok(self
            .tables
            .lock()
            .get(&entity.qualified_name())
            .map_or(0, |t| t.len() as u64))
    }
}

#[derive(Debug, Default)]
struct MetadataState {
    runs: HashMap<Uuid, RunEntity>,
    steps: HashMap<Uuid, StepRecord>,
    step_runs: HashMap<(Uuid, Uuid), StepRunEntity>,
    repeats: HashMap<Uuid, HashSet<Uuid>>,
}

/// A metadata store backed by hash maps.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    state: Mutex<MetadataState>,
    unavailable: AtomicBool,
}

impl MemoryMetadataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns a stored step record.
    #[must_use]
    pub fn step(&self, id: Uuid) -> Option<StepRecord> {
        self.state.lock().steps.get(&id).cloned()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("metadata store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_run(&self, run: &RunEntity) -> Result<(), StoreError> {
        self.check()?;
        let mut state = self.state.lock();
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Query(format!("run {} already exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &RunEntity) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunEntity>, StoreError> {
        self.check()?;
        Ok(self.state.lock().runs.get(&id).cloned())
    }

    async fn upsert_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        self.check()?;
        self.state.lock().steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn save_step_run(&self, step_run: &StepRunEntity) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .lock()
            .step_runs
            .insert((step_run.step_id, step_run.run_id), step_run.clone());
        Ok(())
    }

    async fn step_runs(&self, run_id: Uuid) -> Result<Vec<StepRunEntity>, StoreError> {
        self.check()?;
        let mut runs: Vec<StepRunEntity> = self
            .state
            .lock()
            .step_runs
            .values()
            .filter(|sr| sr.run_id == run_id)
            .cloned()
            .collect();
        runs.sort_by_key(|sr| sr.ordering);
        Ok(runs)
    }

    async fn load_repeats(&self, step_id: Uuid) -> Result<HashSet<Uuid>, StoreError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .repeats
            .get(&step_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn persist_repeats(&self, step_id: Uuid, hashes: &[Uuid]) -> Result<(), StoreError> {
        self.check()?;
        self.state
            .lock()
            .repeats
            .entry(step_id)
            .or_default()
            .extend(hashes.iter().copied());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrType;
    use serde_json::json;

    fn parent() -> LoadEntity {
        LoadEntity::builder("parent")
            .identifying_attribute("name", AttrType::Text)
            .build()
            .unwrap()
    }

    fn child() -> LoadEntity {
        LoadEntity::builder("child")
            .identifying_foreign_key("parent_id", "parent")
            .build()
            .unwrap()
    }

    fn row(key: u128, values: Vec<Value>) -> PreparedRow {
        let mut all = vec![json!(Uuid::from_u128(key).to_string())];
        all.extend(values);
        PreparedRow {
            key: Uuid::from_u128(key),
            values: all,
        }
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_insert_then_upsert() {
        let store = MemoryTargetStore::new();
        let entity = parent();
        let columns = cols(&["id", "name"]);

        let stats = store
            .bulk_write(&entity, &columns, &[row(1, vec![json!("a")]), row(2, vec![json!("b")])], WriteMode::Insert)
            .await
            .unwrap();
        assert_eq!(stats.inserted, 2);

        let stats = store
            .bulk_write(&entity, &columns, &[row(1, vec![json!("a")])], WriteMode::Insert)
            .await
            .unwrap();
        assert_eq!((stats.inserted, stats.updated), (0, 1));
        assert_eq!(store.row_count(&entity).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_ignores_missing_keys() {
        let store = MemoryTargetStore::new();
        let entity = parent();
        let stats = store
            .bulk_write(&entity, &cols(&["id", "name"]), &[row(9, vec![json!("x")])], WriteMode::Update)
            .await
            .unwrap();
        assert_eq!(stats, WriteStats::default());
        assert_eq!(store.row_count(&entity).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_foreign_key_enforced() {
        let store = MemoryTargetStore::new().with_foreign_key_checks();
        let missing = Uuid::from_u128(77).to_string();
        let err = store
            .bulk_write(&child(), &cols(&["id", "parent_id"]), &[row(1, vec![json!(missing)])], WriteMode::Insert)
            .await
            .unwrap_err();
        match err {
            StoreError::ForeignKeyViolation { column, value, .. } => {
                assert_eq!(column, "parent_id");
                assert_eq!(value, missing);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let store = MemoryTargetStore::new();
        store.fail_next_write("parent", StoreError::Query("boom".into()));
        let entity = parent();
        let columns = cols(&["id", "name"]);
        let rows = [row(1, vec![json!("a")])];

        assert!(store.bulk_write(&entity, &columns, &rows, WriteMode::Insert).await.is_err());
        assert!(store.bulk_write(&entity, &columns, &rows, WriteMode::Insert).await.is_ok());
    }

    #[tokio::test]
    async fn test_repeats_are_append_only() {
        let store = MemoryMetadataStore::new();
        let step = Uuid::from_u128(1);
        store.persist_repeats(step, &[Uuid::from_u128(2)]).await.unwrap();
        store.persist_repeats(step, &[Uuid::from_u128(2), Uuid::from_u128(3)]).await.unwrap();
        assert_eq!(store.load_repeats(step).await.unwrap().len(), 2);
    }

    #[test]
    fn test_run_round_trips() {
        let store = MemoryMetadataStore::new();
        let mut run = RunEntity::new(Uuid::from_u128(5));
        run.start();
        tokio_test::assert_ok!(tokio_test::block_on(store.create_run(&run)));
        let loaded = tokio_test::block_on(store.get_run(run.id)).unwrap();
        assert_eq!(loaded.map(|r| r.status), Some(run.status));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryMetadataStore::new();
        store.set_unavailable(true);
        let err = store.get_run(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
