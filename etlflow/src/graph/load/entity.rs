//! Target entity descriptors.

use super::AttrType;
use crate::errors::{ContractErrorInfo, ValidationError};
use crate::identity::identity_hash_parts;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;
use uuid::Uuid;

static IDENTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").ok());

fn is_identifier(text: &str) -> bool {
    IDENTIFIER.as_ref().is_some_and(|re| re.is_match(text))
}

/// Describes a target table: columns, types, keys and row identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadEntity {
    table: String,
    schema: Option<String>,
    primary_key: String,
    attributes: BTreeMap<String, AttrType>,
    foreign_keys: BTreeMap<String, String>,
    identifying_attributes: BTreeSet<String>,
    identifying_foreign_keys: BTreeSet<String>,
}

impl LoadEntity {
    /// Starts building an entity for `table`.
    #[must_use]
    pub fn builder(table: impl Into<String>) -> LoadEntityBuilder {
        LoadEntityBuilder {
            entity: Self {
                table: table.into(),
                schema: None,
                primary_key: "id".to_string(),
                attributes: BTreeMap::new(),
                foreign_keys: BTreeMap::new(),
                identifying_attributes: BTreeSet::new(),
                identifying_foreign_keys: BTreeSet::new(),
            },
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the schema, if any.
    #[must_use]
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Returns `schema.table`, or just the table without a schema.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }

    /// Returns the primary-key column.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Returns attribute types by name.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, AttrType> {
        &self.attributes
    }

    /// Returns foreign-key columns and the tables they reference.
    #[must_use]
    pub fn foreign_keys(&self) -> &BTreeMap<String, String> {
        &self.foreign_keys
    }

    /// Returns the identifying attributes.
    #[must_use]
    pub fn identifying_attributes(&self) -> &BTreeSet<String> {
        &self.identifying_attributes
    }

    /// Returns the identifying foreign keys.
    #[must_use]
    pub fn identifying_foreign_keys(&self) -> &BTreeSet<String> {
        &self.identifying_foreign_keys
    }

    /// Returns true when the entity has at least one identifying field.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        !self.identifying_attributes.is_empty() || !self.identifying_foreign_keys.is_empty()
    }

    /// Returns the type of a column. Keys are UUIDs.
    #[must_use]
    pub fn column_type(&self, column: &str) -> Option<AttrType> {
        if column == self.primary_key || self.foreign_keys.contains_key(column) {
            return Some(AttrType::Uuid);
        }
        self.attributes.get(column).copied()
    }

    /// Returns all columns: primary key, attributes, then foreign keys.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(self.primary_key.clone())
            .chain(self.attributes.keys().cloned())
            .chain(self.foreign_keys.keys().cloned())
            .collect()
    }

    /// Computes the content-hash primary key of a row.
    ///
    /// `values` holds coerced column values; only identifying fields are
    /// read. The key is independent of column order and arrival order.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when an identifying field is absent.
    pub fn row_key(&self, values: &BTreeMap<String, Value>) -> Result<Uuid, ValidationError> {
        let pick = |names: &BTreeSet<String>| -> Result<Map<String, Value>, ValidationError> {
            names
                .iter()
                .map(|name| {
                    values
                        .get(name)
                        .map(|v| (name.clone(), v.clone()))
                        .ok_or_else(|| missing_identifying(&self.table, name))
                })
                .collect()
        };
        let attrs = pick(&self.identifying_attributes)?;
        let fks = pick(&self.identifying_foreign_keys)?;
        Ok(identity_hash_parts(&[Value::Object(attrs), Value::Object(fks)]))
    }
}

pub(crate) fn missing_identifying(table: &str, field: &str) -> ValidationError {
    ValidationError::new(format!(
        "Identifying field '{field}' of '{table}' is not wired into the load"
    ))
    .with_error_info(
        ContractErrorInfo::new("ENTITY-001-IDENTIFYING", "Missing identifying field")
            .with_fix_hint("Wire every identifying attribute and foreign key, or supply an explicit key.")
            .with_context_entry("table", table)
            .with_context_entry("field", field),
    )
}

/// Builder for [`LoadEntity`].
#[derive(Debug, Clone)]
pub struct LoadEntityBuilder {
    entity: LoadEntity,
}

impl LoadEntityBuilder {
    /// Sets the schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.entity.schema = Some(schema.into());
        self
    }

    /// Sets the primary-key column (default `id`).
    #[must_use]
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        self.entity.primary_key = column.into();
        self
    }

    /// Declares an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        self.entity.attributes.insert(name.into(), ty);
        self
    }

    /// Declares an attribute that is part of the row identity.
    #[must_use]
    pub fn identifying_attribute(mut self, name: impl Into<String>, ty: AttrType) -> Self {
        let name = name.into();
        self.entity.identifying_attributes.insert(name.clone());
        self.entity.attributes.insert(name, ty);
        self
    }

    /// Declares a foreign key referencing another table's primary key.
    #[must_use]
    pub fn foreign_key(mut self, name: impl Into<String>, references: impl Into<String>) -> Self {
        self.entity.foreign_keys.insert(name.into(), references.into());
        self
    }

    /// Declares a foreign key that is part of the row identity.
    #[must_use]
    pub fn identifying_foreign_key(
        mut self,
        name: impl Into<String>,
        references: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.entity.identifying_foreign_keys.insert(name.clone());
        self.entity.foreign_keys.insert(name, references.into());
        self
    }

    /// Validates and builds the entity.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for invalid identifiers or a column
    /// declared twice.
    pub fn build(self) -> Result<LoadEntity, ValidationError> {
        let entity = self.entity;

        let mut names: Vec<&str> = vec![entity.table.as_str(), entity.primary_key.as_str()];
        names.extend(entity.schema.as_deref());
        names.extend(entity.attributes.keys().map(String::as_str));
        names.extend(entity.foreign_keys.keys().map(String::as_str));
        names.extend(entity.foreign_keys.values().flat_map(|t| t.split('.')));
        if let Some(bad) = names.iter().find(|n| !is_identifier(n)) {
            return Err(ValidationError::new(format!(
                "'{bad}' is not a valid identifier for entity '{}'",
                entity.table
            )));
        }

        let mut seen = HashSet::new();
        seen.insert(entity.primary_key.as_str());
        for column in entity.attributes.keys().chain(entity.foreign_keys.keys()) {
            if !seen.insert(column.as_str()) {
                return Err(ValidationError::new(format!(
                    "Column '{column}' is declared more than once on '{}'",
                    entity.table
                )));
            }
        }

        Ok(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn person() -> LoadEntity {
        LoadEntity::builder("person")
            .schema("public")
            .identifying_attribute("name", AttrType::Text)
            .attribute("age", AttrType::Integer)
            .identifying_foreign_key("org_id", "org")
            .build()
            .unwrap()
    }

    #[test]
    fn test_row_key_reads_only_identifying_fields() {
        let entity = person();
        let mut a = BTreeMap::new();
        a.insert("name".to_string(), json!("ada"));
        a.insert("org_id".to_string(), json!("x"));
        a.insert("age".to_string(), json!(36));
        let mut b = a.clone();
        b.insert("age".to_string(), json!(37));

        assert_eq!(entity.row_key(&a).unwrap(), entity.row_key(&b).unwrap());

        b.insert("name".to_string(), json!("grace"));
        assert_ne!(entity.row_key(&a).unwrap(), entity.row_key(&b).unwrap());
    }

    #[test]
    fn test_row_key_missing_identifying_field() {
        let mut values = BTreeMap::new();
        values.insert("name".to_string(), json!("ada"));
        let err = person().row_key(&values).unwrap_err();
        assert_eq!(err.code(), Some("ENTITY-001-IDENTIFYING"));
    }

    #[test]
    fn test_columns_and_types() {
        let entity = person();
        assert_eq!(entity.qualified_name(), "public.person");
        assert_eq!(entity.columns(), vec!["id", "age", "name", "org_id"]);
        assert_eq!(entity.column_type("org_id"), Some(AttrType::Uuid));
        assert_eq!(entity.column_type("id"), Some(AttrType::Uuid));
        assert_eq!(entity.column_type("nope"), None);
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let result = LoadEntity::builder("bad table")
            .attribute("x", AttrType::Text)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let result = LoadEntity::builder("t")
            .attribute("x", AttrType::Text)
            .foreign_key("x", "other")
            .build();
        assert!(result.is_err());
    }
}
