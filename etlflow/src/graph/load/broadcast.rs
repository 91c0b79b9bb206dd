//! Expansion of scalar and sequence load inputs to a common row count.

use crate::errors::BroadcastError;
use serde_json::Value;
use std::collections::BTreeMap;

/// One resolved load input.
#[derive(Debug, Clone)]
pub struct BroadcastInput {
    /// Column name.
    pub name: String,
    /// Resolved value.
    pub value: Value,
    /// Whether an array value is a sequence rather than a single cell.
    pub expands: bool,
}

/// Rows produced from one set of load inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    /// Column values per row.
    pub rows: Vec<BTreeMap<String, Value>>,
    /// True when at least one input was a sequence.
    pub sequence: bool,
}

/// Broadcasts inputs to `N` rows.
///
/// Scalars and length-1 sequences are repeated; all other sequences must
/// share one length `N`. Without sequences the result is a single row.
///
/// # Errors
///
/// Returns a [`BroadcastError`] when two sequences of length other than 1
/// disagree.
pub fn broadcast(node: &str, inputs: Vec<BroadcastInput>) -> Result<Broadcast, BroadcastError> {
    let lengths: Vec<(String, usize)> = inputs
        .iter()
        .filter(|input| input.expands)
        .filter_map(|input| input.value.as_array().map(|a| (input.name.clone(), a.len())))
        .collect();

    let sequence = !lengths.is_empty();
    let mut expanded = lengths.iter().map(|(_, len)| *len).filter(|len| *len != 1);
    let target = expanded.next();
    if let Some(n) = target {
        if expanded.any(|len| len != n) {
            return Err(BroadcastError {
                node: node.to_string(),
                lengths,
            });
        }
    }
    let count = target.unwrap_or(1);

    let columns: Vec<(String, Vec<Value>)> = inputs
        .into_iter()
        .map(|input| {
            let values = match input.value {
                Value::Array(items) if input.expands => {
                    if items.len() == 1 {
                        vec![items[0].clone(); count]
                    } else {
                        items
                    }
                }
                other => vec![other; count],
            };
            (input.name, values)
        })
        .collect();

    let mut rows = vec![BTreeMap::new(); count];
    for (name, values) in columns {
        for (row, value) in rows.iter_mut().zip(values) {
            row.insert(name.clone(), value);
        }
    }

    Ok(Broadcast { rows, sequence })
}
