//! Transform nodes: pure functions over resolved inputs.

use super::{Arg, ComputationalNode, Dependency, Input, NodeSpec, RowError, RowNamespace};
use crate::core::{NodeKind, NodeOutput, Row};
use crate::errors::{TransformError, TransformFailure, ValidationError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The user function behind a transform node.
pub type TransformFn =
    Arc<dyn Fn(&TransformInputs) -> Result<NodeOutput, TransformError> + Send + Sync>;

/// Inputs handed to a transform function.
///
/// Inputs named with a non-negative integer are positional, ordered by that
/// integer; every other input is a keyword.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformInputs {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl TransformInputs {
    /// Splits resolved named inputs into positional and keyword inputs.
    #[must_use]
    pub fn from_named(named: BTreeMap<String, Value>) -> Self {
        let mut indexed: Vec<(usize, Value)> = Vec::new();
        let mut keyword = BTreeMap::new();
        for (name, value) in named {
            match name.parse::<usize>() {
                Ok(index) => indexed.push((index, value)),
                Err(_) => {
                    keyword.insert(name, value);
                }
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        Self {
            positional: indexed.into_iter().map(|(_, v)| v).collect(),
            keyword,
        }
    }

    /// Returns the positional inputs.
    #[must_use]
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Returns the keyword inputs.
    #[must_use]
    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Returns a positional input.
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Returns a keyword input.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Returns a keyword input or fails the transform.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Failed`] when the input is absent.
    pub fn required(&self, name: &str) -> Result<&Value, TransformError> {
        self.get(name)
            .ok_or_else(|| TransformError::failed(format!("missing input '{name}'")))
    }
}

/// A transform node.
#[derive(Clone)]
pub struct TransformNode {
    spec: NodeSpec,
    func: TransformFn,
}

impl TransformNode {
    /// Starts building a transform node.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> TransformNodeBuilder {
        TransformNodeBuilder {
            name: name.into(),
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            version: None,
            definition: String::new(),
            dependency: Dependency::new(),
        }
    }

    /// Applies the transform to the row in flight.
    ///
    /// # Errors
    ///
    /// Returns [`RowError::Skip`] for a skip signal and [`RowError::Fatal`]
    /// for unresolvable inputs, user failures and arity mismatches.
    pub fn apply(&self, ns: &RowNamespace) -> Result<Row, RowError> {
        let mut named = BTreeMap::new();
        for (name, input) in &self.spec.inputs {
            named.insert(name.clone(), input.resolve(ns, &self.spec.name)?);
        }
        let inputs = TransformInputs::from_named(named);

        match (self.func)(&inputs) {
            Ok(output) => Ok(output.resolve(&self.spec.name, &self.spec.outputs)?),
            Err(TransformError::Skip(reason)) => Err(RowError::Skip(reason)),
            Err(TransformError::Failed(err)) => {
                Err(RowError::Fatal(
                    TransformFailure {
                        node: self.spec.name.clone(),
                        message: err.to_string(),
                        trace: format!("Transform '{}' failed: {err:?}", self.spec.name),
                    }
                    .into(),
                ))
            }
        }
    }
}

impl ComputationalNode for TransformNode {
    fn spec(&self) -> &NodeSpec {
        &self.spec
    }
}

impl fmt::Debug for TransformNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformNode")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TransformNode`].
#[derive(Debug, Clone)]
pub struct TransformNodeBuilder {
    name: String,
    inputs: BTreeMap<String, Input>,
    outputs: Vec<String>,
    version: Option<String>,
    definition: String,
    dependency: Dependency,
}

impl TransformNodeBuilder {
    /// Wires an input to another node's output.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, arg: Arg) -> Self {
        self.inputs.insert(name.into(), Input::Arg(arg));
        self
    }

    /// Adds a constant input.
    #[must_use]
    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), Input::constant(value));
        self
    }

    /// Sets the ordered output names.
    #[must_use]
    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the node version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the definition text that stands in for the function body in the
    /// node identity.
    #[must_use]
    pub fn definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = definition.into();
        self
    }

    /// Declares extra needs or yields.
    #[must_use]
    pub fn dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = dependency;
        self
    }

    /// Builds the node.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for missing or duplicate outputs.
    pub fn build<F>(self, func: F) -> Result<TransformNode, ValidationError>
    where
        F: Fn(&TransformInputs) -> Result<NodeOutput, TransformError> + Send + Sync + 'static,
    {
        if self.outputs.is_empty() {
            return Err(ValidationError::new(format!(
                "Transform '{}' must declare at least one output",
                self.name
            ))
            .with_nodes(vec![self.name]));
        }
        let spec = NodeSpec::new(
            NodeKind::Transform,
            self.name,
            self.version,
            self.definition,
            self.inputs,
            self.outputs,
            self.dependency,
        )?;
        Ok(TransformNode {
            spec,
            func: Arc::new(func),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EtlError;
    use serde_json::json;
    use uuid::Uuid;

    fn upstream() -> Arg {
        Arg::new(Uuid::nil(), "x")
    }

    fn namespace(x: Value) -> RowNamespace {
        let mut ns = RowNamespace::new();
        ns.insert(Uuid::nil(), &["x".to_string()], vec![x]);
        ns
    }

    fn plus_one() -> TransformNode {
        TransformNode::builder("plus_one")
            .input("x", upstream())
            .outputs(["y"])
            .build(|inputs| {
                let x = inputs.required("x")?.as_i64().ok_or_else(|| TransformError::failed("x is not an integer"))?;
                Ok(NodeOutput::scalar(x + 1))
            })
            .unwrap()
    }

    #[test]
    fn test_positional_and_keyword_split() {
        let mut named = BTreeMap::new();
        named.insert("1".to_string(), json!("b"));
        named.insert("0".to_string(), json!("a"));
        named.insert("flag".to_string(), json!(true));
        let inputs = TransformInputs::from_named(named);

        assert_eq!(inputs.positional(), &[json!("a"), json!("b")]);
        assert_eq!(inputs.get("flag"), Some(&json!(true)));
        assert_eq!(inputs.arg(2), None);
    }

    #[test]
    fn test_apply_scalar() {
        let row = plus_one().apply(&namespace(json!(4))).unwrap();
        assert_eq!(row, vec![json!(5)]);
    }

    #[test]
    fn test_user_failure_is_fatal_with_trace() {
        let err = plus_one().apply(&namespace(json!("four"))).unwrap_err();
        match err {
            RowError::Fatal(EtlError::Transform(failure)) => {
                assert_eq!(failure.node, "plus_one");
                assert!(failure.trace.contains("x is not an integer"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_skip_signal() {
        let node = TransformNode::builder("odd_only")
            .input("x", upstream())
            .outputs(["x"])
            .build(|inputs| {
                let x = inputs.required("x")?.clone();
                if x.as_i64().unwrap_or(0) % 2 == 0 {
                    return Err(TransformError::skip("even"));
                }
                Ok(NodeOutput::scalar(x))
            })
            .unwrap();

        assert!(matches!(node.apply(&namespace(json!(2))), Err(RowError::Skip(_))));
        assert!(node.apply(&namespace(json!(3))).is_ok());
    }

    #[test]
    fn test_arity_mismatch() {
        let node = TransformNode::builder("pair")
            .input("x", upstream())
            .outputs(["a", "b"])
            .build(|_| Ok(NodeOutput::tuple([1, 2, 3])))
            .unwrap();

        let err = node.apply(&namespace(json!(0))).unwrap_err();
        assert!(matches!(err, RowError::Fatal(EtlError::Arity(_))));
    }

    #[test]
    fn test_missing_arg_is_fatal() {
        let err = plus_one().apply(&RowNamespace::new()).unwrap_err();
        match err {
            RowError::Fatal(EtlError::Validation(v)) => {
                assert_eq!(v.code(), Some("GRAPH-001-MISSING_ARG"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_constant_input() {
        let node = TransformNode::builder("scale")
            .input("x", upstream())
            .constant("factor", 10)
            .outputs(["y"])
            .build(|inputs| {
                let x = inputs.required("x")?.as_i64().unwrap_or(0);
                let f = inputs.required("factor")?.as_i64().unwrap_or(0);
                Ok(NodeOutput::scalar(x * f))
            })
            .unwrap();

        assert_eq!(node.apply(&namespace(json!(3))).unwrap(), vec![json!(30)]);
    }
}
