//! Values produced by extract and transform nodes.

use crate::errors::ArityError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One resolved row: output values in declared-output order.
pub type Row = Vec<Value>;

/// What an extract yields or a transform returns.
///
/// The shape is resolved against the node's declared outputs at run time,
/// never at declaration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NodeOutput {
    /// A single value; valid only when exactly one output is declared.
    Scalar(Value),
    /// Positional values, one per declared output.
    Tuple(Vec<Value>),
    /// Named values; the key set must equal the declared outputs.
    Mapping(Map<String, Value>),
}

impl NodeOutput {
    /// Creates a scalar output.
    #[must_use]
    pub fn scalar(value: impl Into<Value>) -> Self {
        Self::Scalar(value.into())
    }

    /// Creates a positional output.
    #[must_use]
    pub fn tuple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Tuple(values.into_iter().map(Into::into).collect())
    }

    /// Creates a named output.
    #[must_use]
    pub fn mapping<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::Mapping(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Resolves this output against the declared output names.
    ///
    /// # Errors
    ///
    /// Returns an [`ArityError`] when the shape does not match `outputs`.
    pub fn resolve(self, node: &str, outputs: &[String]) -> Result<Row, ArityError> {
        match self {
            Self::Scalar(value) => {
                if outputs.len() == 1 {
                    Ok(vec![value])
                } else {
                    Err(ArityError::new(node, outputs, "a single non-tuple value"))
                }
            }
            Self::Tuple(values) => {
                if values.len() == outputs.len() {
                    Ok(values)
                } else {
                    Err(ArityError::new(
                        node,
                        outputs,
                        format!("a tuple of {} values", values.len()),
                    ))
                }
            }
            Self::Mapping(mut map) => {
                let mut row = Vec::with_capacity(outputs.len());
                for name in outputs {
                    match map.remove(name) {
                        Some(value) => row.push(value),
                        None => {
                            return Err(ArityError::new(
                                node,
                                outputs,
                                format!("a mapping without key '{name}'"),
                            ))
                        }
                    }
                }
                if !map.is_empty() {
                    let mut extra: Vec<&String> = map.keys().collect();
                    extra.sort();
                    return Err(ArityError::new(
                        node,
                        outputs,
                        format!("a mapping with undeclared keys {extra:?}"),
                    ));
                }
                Ok(row)
            }
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<Value>> for NodeOutput {
    fn from(values: Vec<Value>) -> Self {
        Self::Tuple(values)
    }
}

impl From<Map<String, Value>> for NodeOutput {
    fn from(map: Map<String, Value>) -> Self {
        Self::Mapping(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_scalar_with_single_output() {
        let row = NodeOutput::scalar(5).resolve("n", &names(&["x"])).unwrap();
        assert_eq!(row, vec![json!(5)]);
    }

    #[test]
    fn test_scalar_with_two_outputs_fails() {
        let err = NodeOutput::scalar(5)
            .resolve("n", &names(&["a", "b"]))
            .unwrap_err();
        assert_eq!(err.node, "n");
        assert!(err.to_string().contains("single non-tuple"));
    }

    #[test]
    fn test_tuple_arity_mismatch() {
        let err = NodeOutput::tuple([1, 2, 3])
            .resolve("t", &names(&["a", "b"]))
            .unwrap_err();
        assert!(err.to_string().contains("tuple of 3 values"));
    }

    #[test]
    fn test_mapping_is_reordered_to_outputs() {
        let out = NodeOutput::mapping([("b", json!(2)), ("a", json!(1))]);
        let row = out.resolve("m", &names(&["a", "b"])).unwrap();
        assert_eq!(row, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_mapping_missing_and_extra_keys() {
        let missing = NodeOutput::mapping([("a", 1)]).resolve("m", &names(&["a", "b"]));
        assert!(missing.unwrap_err().to_string().contains("without key 'b'"));

        let extra = NodeOutput::mapping([("a", 1), ("z", 2)]).resolve("m", &names(&["a"]));
        assert!(extra.unwrap_err().to_string().contains("undeclared keys"));
    }
}
