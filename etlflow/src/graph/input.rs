//! Node inputs: references to other nodes' outputs, or inline constants.

use crate::errors::{ContractErrorInfo, ValidationError};
use crate::identity::short_hash;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// A reference to a named output of another node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Arg {
    /// Identity hash of the producing node.
    pub key: Uuid,
    /// Output name on the producing node.
    pub name: String,
}

impl Arg {
    /// Creates a new argument reference.
    #[must_use]
    pub fn new(key: Uuid, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
        }
    }
}

/// A node input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    /// Resolved from the per-row namespace.
    Arg(Arg),
    /// Always resolves to the contained value.
    Constant {
        /// The literal value.
        value: Value,
    },
}

impl Input {
    /// Creates a constant input.
    #[must_use]
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant {
            value: value.into(),
        }
    }

    /// Returns the referenced argument, if this is not a constant.
    #[must_use]
    pub fn as_arg(&self) -> Option<&Arg> {
        match self {
            Self::Arg(arg) => Some(arg),
            Self::Constant { .. } => None,
        }
    }

    /// Canonical description of the wiring, part of a node's identity.
    #[must_use]
    pub fn wiring(&self) -> Value {
        match self {
            Self::Arg(arg) => json!(["arg", arg.key.to_string(), arg.name]),
            Self::Constant { value } => json!(["const", value]),
        }
    }

    /// Resolves the input for the row currently in flight.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the consuming node when the
    /// referenced node or output is absent from the namespace.
    pub fn resolve(&self, ns: &RowNamespace, node: &str) -> Result<Value, ValidationError> {
        match self {
            Self::Constant { value } => Ok(value.clone()),
            Self::Arg(arg) => ns.get(arg).cloned().ok_or_else(|| {
                ValidationError::new(format!(
                    "Node '{}' references output '{}' of node {} which was not produced for this row",
                    node,
                    arg.name,
                    short_hash(&arg.key)
                ))
                .with_nodes(vec![node.to_string()])
                .with_error_info(
                    ContractErrorInfo::new("GRAPH-001-MISSING_ARG", "Unresolvable argument")
                        .with_fix_hint("Did you add all transforms to the step?"),
                )
            }),
        }
    }
}

impl From<Arg> for Input {
    fn from(arg: Arg) -> Self {
        Self::Arg(arg)
    }
}

/// Outputs of every node already run for the row in flight, keyed by node
/// identity.
#[derive(Debug, Default, Clone)]
pub struct RowNamespace {
    values: HashMap<Uuid, HashMap<String, Value>>,
}

impl RowNamespace {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a node's outputs, pairing names with values positionally.
    pub fn insert(&mut self, node: Uuid, names: &[String], values: Vec<Value>) {
        let entry = self.values.entry(node).or_default();
        for (name, value) in names.iter().zip(values) {
            entry.insert(name.clone(), value);
        }
    }

    /// Looks up an argument.
    #[must_use]
    pub fn get(&self, arg: &Arg) -> Option<&Value> {
        self.values.get(&arg.key).and_then(|outputs| outputs.get(&arg.name))
    }

    /// Clears the namespace for reuse on the next row.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_always_resolves() {
        let ns = RowNamespace::new();
        let input = Input::constant(42);
        assert_eq!(input.resolve(&ns, "n").unwrap(), json!(42));
    }

    #[test]
    fn test_arg_resolves_from_namespace() {
        let key = Uuid::new_v4();
        let mut ns = RowNamespace::new();
        ns.insert(key, &["x".to_string()], vec![json!("hello")]);

        let input: Input = Arg::new(key, "x").into();
        assert_eq!(input.resolve(&ns, "consumer").unwrap(), json!("hello"));
    }

    #[test]
    fn test_missing_arg_is_descriptive() {
        let ns = RowNamespace::new();
        let input: Input = Arg::new(Uuid::new_v4(), "missing").into();
        let err = input.resolve(&ns, "consumer").unwrap_err();

        assert!(err.message.contains("consumer"));
        assert!(err.message.contains("missing"));
        assert_eq!(err.code(), Some("GRAPH-001-MISSING_ARG"));
    }

    #[test]
    fn test_wiring_distinguishes_constants_and_args() {
        let key = Uuid::nil();
        assert_ne!(Input::constant("x").wiring(), Input::from(Arg::new(key, "x")).wiring());
    }
}
