//! The shared shape of extract, transform and load nodes.

use super::{Arg, Dependency, Input};
use crate::core::NodeKind;
use crate::errors::{
    ArityError, BroadcastError, CoercionError, ContractErrorInfo, EtlError, ValidationError,
};
use crate::identity::identity_hash_parts;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Wiring and identity common to every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node kind.
    pub kind: NodeKind,
    /// Human-readable name, used in errors and logs.
    pub name: String,
    /// Optional user-supplied version; bump it when the code behind a
    /// closure changes so the node (and its step) get a new identity.
    pub version: Option<String>,
    /// Definition text: query text, entity descriptor or a user label.
    pub definition: String,
    /// Named inputs. Order is irrelevant.
    pub inputs: BTreeMap<String, Input>,
    /// Ordered, unique output names.
    pub outputs: Vec<String>,
    /// What the node needs and yields.
    pub dependency: Dependency,
    identity: Uuid,
}

impl NodeSpec {
    /// Builds a spec and computes its identity.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty name or duplicate outputs.
    pub fn new(
        kind: NodeKind,
        name: impl Into<String>,
        version: Option<String>,
        definition: impl Into<String>,
        inputs: BTreeMap<String, Input>,
        outputs: Vec<String>,
        dependency: Dependency,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::new(format!("{kind} node name cannot be empty")));
        }

        let mut seen = HashSet::new();
        for output in &outputs {
            if !seen.insert(output.as_str()) {
                return Err(ValidationError::new(format!(
                    "Node '{name}' declares output '{output}' more than once"
                ))
                .with_nodes(vec![name.clone()])
                .with_error_info(ContractErrorInfo::new(
                    "GRAPH-003-DUPLICATE_OUTPUT",
                    format!("Duplicate output name '{output}'"),
                )));
            }
        }

        let definition = definition.into();
        let wiring: Map<String, Value> = inputs
            .iter()
            .map(|(name, input)| (name.clone(), input.wiring()))
            .collect();
        let identity = identity_hash_parts(&[
            json!(kind.to_string()),
            json!(name),
            json!(version),
            json!(definition),
            Value::Object(wiring),
            json!(outputs),
        ]);

        Ok(Self {
            kind,
            name,
            version,
            definition,
            inputs,
            outputs,
            dependency,
            identity,
        })
    }

    /// Returns the identity hash.
    #[must_use]
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Returns a reference to one of this node's outputs.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when `name` is not a declared output.
    pub fn output(&self, name: &str) -> Result<Arg, ValidationError> {
        if self.outputs.iter().any(|o| o == name) {
            Ok(Arg::new(self.identity, name))
        } else {
            Err(ValidationError::new(format!(
                "Node '{}' has no output '{}' (declared: {:?})",
                self.name, name, self.outputs
            ))
            .with_nodes(vec![self.name.clone()]))
        }
    }

    /// Iterates over inputs that reference other nodes.
    pub fn args(&self) -> impl Iterator<Item = (&String, &Arg)> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| input.as_arg().map(|arg| (name, arg)))
    }
}

/// Why a node did not produce a value for the row in flight.
#[derive(Debug)]
pub enum RowError {
    /// Row-scoped skip signal; remaining nodes are not run for this row.
    Skip(String),
    /// Fatal for the containing batch.
    Fatal(EtlError),
}

impl From<EtlError> for RowError {
    fn from(err: EtlError) -> Self {
        Self::Fatal(err)
    }
}

macro_rules! fatal_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RowError {
            fn from(err: $ty) -> Self {
                Self::Fatal(err.into())
            }
        })*
    };
}

fatal_from!(ValidationError, ArityError, BroadcastError, CoercionError);

/// Base abstraction over extract, transform and load nodes.
pub trait ComputationalNode: Send + Sync {
    /// Returns the node's wiring and identity.
    fn spec(&self) -> &NodeSpec;

    /// Returns the node name.
    fn name(&self) -> &str {
        &self.spec().name
    }

    /// Returns the node kind.
    fn kind(&self) -> NodeKind {
        self.spec().kind
    }

    /// Returns the identity hash.
    fn identity(&self) -> Uuid {
        self.spec().identity()
    }

    /// Returns the ordered output names.
    fn outputs(&self) -> &[String] {
        &self.spec().outputs
    }

    /// Returns the node dependency.
    fn dependency(&self) -> &Dependency {
        &self.spec().dependency
    }

    /// Returns a reference to one of the node's outputs.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an undeclared output.
    fn output(&self, name: &str) -> Result<Arg, ValidationError> {
        self.spec().output(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, outputs: &[&str], inputs: BTreeMap<String, Input>) -> NodeSpec {
        NodeSpec::new(
            NodeKind::Transform,
            name,
            None,
            "",
            inputs,
            outputs.iter().map(|s| (*s).to_string()).collect(),
            Dependency::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_identity_depends_on_wiring() {
        let a = spec("t", &["y"], BTreeMap::new());
        let mut inputs = BTreeMap::new();
        inputs.insert("x".to_string(), Input::constant(1));
        let b = spec("t", &["y"], inputs);

        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.identity(), spec("t", &["y"], BTreeMap::new()).identity());
    }

    #[test]
    fn test_duplicate_outputs_rejected() {
        let err = NodeSpec::new(
            NodeKind::Extract,
            "e",
            None,
            "",
            BTreeMap::new(),
            vec!["a".into(), "a".into()],
            Dependency::new(),
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("GRAPH-003-DUPLICATE_OUTPUT"));
    }

    #[test]
    fn test_output_reference() {
        let node = spec("t", &["y"], BTreeMap::new());
        let arg = node.output("y").unwrap();
        assert_eq!(arg.key, node.identity());
        assert!(node.output("nope").is_err());
    }

    #[test]
    fn test_empty_name_rejected() {
        let result = NodeSpec::new(
            NodeKind::Load,
            "  ",
            None,
            "",
            BTreeMap::new(),
            Vec::new(),
            Dependency::new(),
        );
        assert!(result.is_err());
    }
}
