//! Whole-batch processing: transforms and load-row preparation.
//!
//! [`process_batch`] is the unit of work handed to a worker. It only reads
//! the immutable step graph and owns its input, so it can run on any thread.

use crate::core::Row;
use crate::errors::EtlError;
use crate::graph::{ComputationalNode, EtlStep, PreparedRow, RowError, RowNamespace, StepNode};
use uuid::Uuid;

/// One admitted input row.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRow {
    /// Input hash recorded as a repeat once the row is flushed.
    pub hash: Uuid,
    /// Values aligned with the extract outputs.
    pub row: Row,
}

/// Output of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Prepared rows per load, indexed like [`EtlStep::loads`].
    pub loads: Vec<Vec<PreparedRow>>,
    /// Hashes of every input the batch handled, skipped rows included.
    pub processed: Vec<Uuid>,
    /// Inputs a transform skipped.
    pub skipped: u64,
}

impl BatchResult {
    /// Returns the total number of prepared rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.loads.iter().map(Vec::len).sum()
    }
}

/// Runs every node of `step` over each input row.
///
/// A skip signal drops the row, including load rows already prepared for
/// it, and counts it as skipped.
///
/// # Errors
///
/// The first fatal row error aborts the whole batch.
pub fn process_batch(step: &EtlStep, batch: Vec<InputRow>) -> Result<BatchResult, EtlError> {
    let extract = step.extract();
    let mut result = BatchResult {
        loads: vec![Vec::new(); step.loads().len()],
        processed: Vec::with_capacity(batch.len()),
        skipped: 0,
    };
    let mut ns = RowNamespace::new();
    let mut staged: Vec<(usize, Vec<PreparedRow>)> = Vec::new();

    'rows: for input in batch {
        ns.clear();
        staged.clear();
        ns.insert(extract.identity(), extract.outputs(), input.row);
        result.processed.push(input.hash);

        for node in step.execution_order() {
            let outcome = match *node {
                StepNode::Transform(i) => {
                    let transform = &step.transforms()[i];
                    transform
                        .apply(&ns)
                        .map(|values| ns.insert(transform.identity(), transform.outputs(), values))
                }
                StepNode::Load(i) => {
                    let load = &step.loads()[i];
                    load.prepare(&ns).map(|prepared| {
                        ns.insert(load.identity(), load.outputs(), vec![prepared.key_output]);
                        staged.push((i, prepared.rows));
                    })
                }
            };

            match outcome {
                Ok(()) => {}
                Err(RowError::Skip(reason)) => {
                    tracing::trace!(
                        step = %step.name(),
                        node = %step.node_name(*node),
                        reason = %reason,
                        "Row skipped"
                    );
                    result.skipped += 1;
                    continue 'rows;
                }
                Err(RowError::Fatal(err)) => return Err(err),
            }
        }

        for (i, rows) in staged.drain(..) {
            result.loads[i].extend(rows);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeOutput;
    use crate::errors::TransformError;
    use crate::graph::{AttrType, ExtractNode, IterExtract, LoadEntity, LoadNode, TransformNode};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn step() -> EtlStep {
        let extract = ExtractNode::builder("numbers")
            .outputs(["x"])
            .build(IterExtract::from_rows("numbers", vec![]))
            .unwrap();
        let incr = TransformNode::builder("incr")
            .input("0", extract.output("x").unwrap())
            .outputs(["y"])
            .build(|inputs| {
                let x = inputs.arg(0).and_then(Value::as_i64).unwrap_or_default();
                if x < 0 {
                    return Err(TransformError::skip("negative"));
                }
                if x == 99 {
                    return Err(TransformError::failed("bad input"));
                }
                Ok(NodeOutput::scalar(x + 1))
            })
            .unwrap();
        let entity = Arc::new(
            LoadEntity::builder("t")
                .identifying_attribute("x", AttrType::Integer)
                .attribute("y", AttrType::Integer)
                .build()
                .unwrap(),
        );
        let load = LoadNode::builder("write_t", entity)
            .input("x", extract.output("x").unwrap())
            .input("y", incr.output("y").unwrap())
            .build()
            .unwrap();
        EtlStep::builder("numbers_step")
            .extract(extract)
            .transform(incr)
            .load(load)
            .build()
            .unwrap()
    }

    fn inputs(step: &EtlStep, values: &[i64]) -> Vec<InputRow> {
        values
            .iter()
            .map(|v| {
                let row = vec![json!(v)];
                InputRow {
                    hash: step.input_hash(&row),
                    row,
                }
            })
            .collect()
    }

    #[test]
    fn test_batch_prepares_load_rows() {
        let step = step();
        let result = process_batch(&step, inputs(&step, &[0, 1, 2])).unwrap();

        assert_eq!(result.loads.len(), 1);
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.processed.len(), 3);
        assert_eq!(result.skipped, 0);
        let ys: Vec<&Value> = result.loads[0].iter().map(|r| &r.values[2]).collect();
        assert_eq!(ys, vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[test]
    fn test_skip_drops_row_but_marks_processed() {
        let step = step();
        let result = process_batch(&step, inputs(&step, &[-1, 4])).unwrap();

        assert_eq!(result.row_count(), 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.processed.len(), 2);
    }

    #[test]
    fn test_failure_aborts_batch() {
        let step = step();
        let err = process_batch(&step, inputs(&step, &[1, 99])).unwrap_err();

        assert!(matches!(err, EtlError::Transform(ref f) if f.node == "incr"));
        assert!(err.trace_text().contains("bad input"));
    }

    #[test]
    fn test_same_input_same_key() {
        let step = step();
        let first = process_batch(&step, inputs(&step, &[5])).unwrap();
        let second = process_batch(&step, inputs(&step, &[5])).unwrap();
        assert_eq!(first.loads[0][0].key, second.loads[0][0].key);
    }
}
