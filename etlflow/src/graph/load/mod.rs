//! Load nodes: typed, keyed rows bound for a target table.

mod broadcast;
mod buffer;
mod entity;
mod types;

pub use broadcast::{broadcast, Broadcast, BroadcastInput};
pub use buffer::LoadBuffer;
pub use entity::{LoadEntity, LoadEntityBuilder};
pub use types::{escape_copy, AttrType};

use super::{Arg, ComputationalNode, Dependency, Input, NodeSpec, RowError, RowNamespace};
use crate::core::NodeKind;
use crate::errors::{CoercionError, ContractErrorInfo, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// How a load reconciles rows with the target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Insert new keys, update existing ones.
    #[default]
    Insert,
    /// Update existing keys only.
    Update,
}

/// Row counts reported by one or more flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    /// Rows whose key was new.
    pub inserted: u64,
    /// Rows whose key already existed.
    pub updated: u64,
    /// Rows dropped by the foreign-key fallback.
    pub dropped: u64,
}

impl WriteStats {
    /// Adds another set of counts to this one.
    pub fn absorb(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.dropped += other.dropped;
    }
}

/// A typed row with its primary key.
///
/// `values` align with [`LoadNode::columns`]; the key is also the first
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedRow {
    /// Primary key.
    pub key: Uuid,
    /// Coerced column values.
    pub values: Vec<Value>,
}

/// The rows one load produced for one input row.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedLoad {
    /// Rows to buffer.
    pub rows: Vec<PreparedRow>,
    /// Value of the load's key output: a key, or an array of keys when any
    /// input was broadcast.
    pub key_output: Value,
}

/// A load node.
#[derive(Clone)]
pub struct LoadNode {
    spec: NodeSpec,
    entity: Arc<LoadEntity>,
    mode: WriteMode,
    columns: Vec<String>,
    explicit_key: bool,
}

impl LoadNode {
    /// Starts building a load into `entity`.
    #[must_use]
    pub fn builder(name: impl Into<String>, entity: Arc<LoadEntity>) -> LoadNodeBuilder {
        LoadNodeBuilder {
            name: name.into(),
            entity,
            inputs: BTreeMap::new(),
            mode: WriteMode::Insert,
            version: None,
            dependency: Dependency::new(),
        }
    }

    /// Returns the target entity.
    #[must_use]
    pub fn entity(&self) -> &Arc<LoadEntity> {
        &self.entity
    }

    /// Returns the write mode.
    #[must_use]
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Returns the written columns: the primary key, then wired columns.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the key output reference, for wiring foreign keys.
    ///
    /// # Errors
    ///
    /// Never fails for a built node; kept fallible to match
    /// [`ComputationalNode::output`].
    pub fn key(&self) -> Result<Arg, ValidationError> {
        self.spec.output(self.entity.primary_key())
    }

    /// Resolves, broadcasts, coerces and keys the rows for the row in
    /// flight.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::Fatal`] for unresolvable inputs, broadcast and
    /// coercion failures.
    pub fn prepare(&self, ns: &RowNamespace) -> Result<PreparedLoad, RowError> {
        let mut inputs = Vec::with_capacity(self.spec.inputs.len());
        for (name, input) in &self.spec.inputs {
            let expands = self
                .entity
                .column_type(name)
                .is_some_and(|ty| ty.broadcasts());
            inputs.push(BroadcastInput {
                name: name.clone(),
                value: input.resolve(ns, &self.spec.name)?,
                expands,
            });
        }
        let expanded = broadcast(&self.spec.name, inputs)?;

        let pk = self.entity.primary_key();
        let mut rows = Vec::with_capacity(expanded.rows.len());
        for raw in expanded.rows {
            let mut coerced = BTreeMap::new();
            for (name, value) in raw {
                let ty = self.entity.column_type(&name).unwrap_or(AttrType::Json);
                let value = ty.coerce(&name, &value)?;
                coerced.insert(name, value);
            }

            let key = match coerced.get(pk).and_then(Value::as_str) {
                Some(text) => Uuid::parse_str(text)
                    .map_err(|_| CoercionError::new(pk, "uuid", &json!(text)))?,
                None => self.entity.row_key(&coerced)?,
            };
            coerced.insert(pk.to_string(), Value::String(key.to_string()));

            let values = self
                .columns
                .iter()
                .map(|column| coerced.remove(column).unwrap_or(Value::Null))
                .collect();
            rows.push(PreparedRow { key, values });
        }

        let key_output = if expanded.sequence {
            Value::Array(rows.iter().map(|r| Value::String(r.key.to_string())).collect())
        } else {
            rows.first()
                .map_or(Value::Null, |r| Value::String(r.key.to_string()))
        };

        Ok(PreparedLoad { rows, key_output })
    }
}

impl ComputationalNode for LoadNode {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }
}

impl fmt::Debug for LoadNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadNode")
            .field("spec", &self.spec)
            .field("mode", &self.mode)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// Builder for [`LoadNode`].
#[derive(Debug, Clone)]
pub struct LoadNodeBuilder {
    name: String,
    entity: Arc<LoadEntity>,
    inputs: BTreeMap<String, Input>,
    mode: WriteMode,
    version: Option<String>,
    dependency: Dependency,
}

impl LoadNodeBuilder {
    /// Wires a column to another node's output.
    #[must_use]
    pub fn input(mut self, column: impl Into<String>, arg: Arg) -> Self {
        self.inputs.insert(column.into(), Input::Arg(arg));
        self
    }

    /// Sets a column to a constant.
    #[must_use]
    pub fn constant(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(column.into(), Input::constant(value));
        self
    }

    /// Supplies primary keys explicitly instead of hashing identifying
    /// fields.
    #[must_use]
    pub fn key(mut self, arg: Arg) -> Self {
        let pk = self.entity.primary_key().to_string();
        self.inputs.insert(pk, Input::Arg(arg));
        self
    }

    /// Sets the write mode.
    #[must_use]
    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the node version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Declares extra needs or yields.
    #[must_use]
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    /// Validates and builds the node.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for columns unknown to the entity, or
    /// identifying fields that are not wired when keys must be hashed.
    pub fn build(self) -> Result<LoadNode, ValidationError> {
        let entity = self.entity;
        let pk = entity.primary_key().to_string();

        for column in self.inputs.keys() {
            if entity.column_type(column).is_none() {
                return Err(ValidationError::new(format!(
                    "Load '{}' wires unknown column '{column}' of '{}'",
                    self.name,
                    entity.table()
                ))
                .with_nodes(vec![self.name.clone()]));
            }
        }

        let explicit_key = self.inputs.contains_key(&pk);
        if !explicit_key && !entity.has_identity() {
            return Err(ValidationError::new(format!(
                "Load '{}' has no way to key rows of '{}'",
                self.name,
                entity.table()
            ))
            .with_nodes(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new("ENTITY-001-IDENTIFYING", "No row identity")
                    .with_fix_hint("Declare identifying fields on the entity or supply an explicit key."),
            ));
        }
        if self.mode == WriteMode::Insert || !explicit_key {
            let identifying = entity
                .identifying_attributes()
                .iter()
                .chain(entity.identifying_foreign_keys());
            for field in identifying {
                if !self.inputs.contains_key(field) {
                    return Err(entity::missing_identifying(entity.table(), field)
                        .with_nodes(vec![self.name.clone()]));
                }
            }
        }

        let table = entity.qualified_name();
        let mut columns = vec![pk.clone()];
        columns.extend(self.inputs.keys().filter(|c| **c != pk).cloned());

        let mut dependency = Dependency::new().yields_table(&table);
        for column in &columns {
            dependency = dependency.yields_column(format!("{table}.{column}"));
        }
        for (fk, references) in entity.foreign_keys() {
            if self.inputs.contains_key(fk) {
                dependency = dependency.needs_table(references);
            }
        }
        let dependency = dependency.merge(&self.dependency);

        let definition = format!(
            "{}:{}",
            serde_json::to_string(entity.as_ref()).map_err(|e| ValidationError::new(e.to_string()))?,
            serde_json::to_string(&self.mode).map_err(|e| ValidationError::new(e.to_string()))?,
        );
        let spec = NodeSpec::new(
            NodeKind::Load,
            self.name,
            self.version,
            definition,
            self.inputs,
            vec![pk],
            dependency,
        )?;

        Ok(LoadNode {
            spec,
            entity,
            mode: self.mode,
            columns,
            explicit_key,
        })
    }
}

impl LoadNode {
    /// Returns true when keys are supplied rather than hashed.
    #[must_use]
    pub fn has_explicit_key(&self) -> bool {
        self.explicit_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EtlError;
    use pretty_assertions::assert_eq;

    fn entity() -> Arc<LoadEntity> {
        Arc::new(
            LoadEntity::builder("t")
                .identifying_attribute("x", AttrType::Integer)
                .attribute("label", AttrType::Text)
                .build()
                .unwrap(),
        )
    }

    fn upstream(name: &str) -> Arg {
        Arg::new(Uuid::nil(), name)
    }

    fn ns(values: &[(&str, Value)]) -> RowNamespace {
        let mut ns = RowNamespace::new();
        let names: Vec<String> = values.iter().map(|(n, _)| (*n).to_string()).collect();
        ns.insert(Uuid::nil(), &names, values.iter().map(|(_, v)| v.clone()).collect());
        ns
    }

    #[test]
    fn test_prepare_single_row() {
        let load = LoadNode::builder("load_t", entity())
            .input("x", upstream("x"))
            .input("label", upstream("label"))
            .build()
            .unwrap();

        let prepared = load.prepare(&ns(&[("x", json!("5")), ("label", json!(9))])).unwrap();
        assert_eq!(prepared.rows.len(), 1);
        let row = &prepared.rows[0];
        assert_eq!(load.columns(), &["id", "label", "x"]);
        assert_eq!(row.values[1], json!("9"));
        assert_eq!(row.values[2], json!(5));
        assert_eq!(prepared.key_output, json!(row.key.to_string()));
    }

    #[test]
    fn test_key_is_stable_across_types_and_other_columns() {
        let load = LoadNode::builder("load_t", entity())
            .input("x", upstream("x"))
            .input("label", upstream("label"))
            .build()
            .unwrap();

        let a = load.prepare(&ns(&[("x", json!(5)), ("label", json!("a"))])).unwrap();
        let b = load.prepare(&ns(&[("x", json!("5")), ("label", json!("b"))])).unwrap();
        assert_eq!(a.rows[0].key, b.rows[0].key);
    }

    #[test]
    fn test_prepare_broadcasts() {
        let load = LoadNode::builder("load_t", entity())
            .input("x", upstream("x"))
            .constant("label", "same")
            .build()
            .unwrap();

        let prepared = load.prepare(&ns(&[("x", json!([1, 2, 3]))])).unwrap();
        assert_eq!(prepared.rows.len(), 3);
        assert_eq!(prepared.key_output.as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_coercion_failure_is_fatal() {
        let load = LoadNode::builder("load_t", entity())
            .input("x", upstream("x"))
            .build()
            .unwrap();

        let err = load.prepare(&ns(&[("x", json!("five"))])).unwrap_err();
        assert!(matches!(err, RowError::Fatal(EtlError::Coercion(_))));
    }

    #[test]
    fn test_missing_identifying_field_rejected_at_build() {
        let err = LoadNode::builder("load_t", entity())
            .input("label", upstream("label"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("ENTITY-001-IDENTIFYING"));
    }

    #[test]
    fn test_update_with_explicit_key() {
        let key = Uuid::from_u128(7);
        let load = LoadNode::builder("relabel", entity())
            .key(upstream("id"))
            .input("label", upstream("label"))
            .mode(WriteMode::Update)
            .build()
            .unwrap();

        let prepared = load
            .prepare(&ns(&[("id", json!(key.to_string())), ("label", json!("z"))]))
            .unwrap();
        assert!(load.has_explicit_key());
        assert_eq!(prepared.rows[0].key, key);
    }

    #[test]
    fn test_dependency_declares_table_and_fk_needs() {
        let child = Arc::new(
            LoadEntity::builder("child")
                .identifying_foreign_key("parent_id", "parent")
                .build()
                .unwrap(),
        );
        let load = LoadNode::builder("load_child", child)
            .input("parent_id", upstream("parent"))
            .build()
            .unwrap();

        let dep = load.dependency();
        assert!(dep.tables_yielded().contains("child"));
        assert!(dep.columns_yielded().contains("child.parent_id"));
        assert!(dep.tables_needed().contains("parent"));
        assert_eq!(load.outputs(), &["id".to_string()]);
    }

    #[test]
    fn test_unknown_column_rejected() {
        let result = LoadNode::builder("load_t", entity())
            .input("x", upstream("x"))
            .input("nope", upstream("nope"))
            .build();
        assert!(result.is_err());
    }
}
