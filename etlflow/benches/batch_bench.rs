//! Benchmarks for batch processing and identity hashing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use etlflow::core::NodeOutput;
use etlflow::graph::{
    AttrType, ComputationalNode, EtlStep, ExtractNode, IterExtract, LoadEntity, LoadNode, TransformNode,
};
use etlflow::identity::identity_hash;
use etlflow::pipeline::{process_batch, InputRow};
use serde_json::json;
use std::sync::Arc;

fn step() -> EtlStep {
    let extract = ExtractNode::builder("numbers")
        .outputs(["x", "label"])
        .build(IterExtract::from_rows("numbers", Vec::new()))
        .unwrap();
    let incr = TransformNode::builder("incr")
        .input("x", extract.output("x").unwrap())
        .outputs(["y"])
        .build(|inputs| {
            let x = inputs.required("x")?.as_i64().unwrap_or_default();
            Ok(NodeOutput::scalar(x * 2 + 1))
        })
        .unwrap();
    let entity = Arc::new(
        LoadEntity::builder("numbers")
            .identifying_attribute("x", AttrType::Integer)
            .attribute("y", AttrType::Integer)
            .attribute("label", AttrType::Text)
            .build()
            .unwrap(),
    );
    let load = LoadNode::builder("write", entity)
        .input("x", extract.output("x").unwrap())
        .input("y", incr.output("y").unwrap())
        .input("label", extract.output("label").unwrap())
        .build()
        .unwrap();
    EtlStep::builder("numbers")
        .extract(extract)
        .transform(incr)
        .load(load)
        .build()
        .unwrap()
}

fn batch(step: &EtlStep, size: i64) -> Vec<InputRow> {
    (0..size)
        .map(|x| {
            let row = vec![json!(x), json!(format!("row-{x}"))];
            InputRow {
                hash: step.input_hash(&row),
                row,
            }
        })
        .collect()
}

fn batch_benchmark(c: &mut Criterion) {
    let step = step();
    let mut group = c.benchmark_group("process_batch");
    for size in [100_i64, 1_000, 10_000] {
        let rows = batch(&step, size);
        group.throughput(Throughput::Elements(size.unsigned_abs()));
        group.bench_with_input(BenchmarkId::from_parameter(size), &rows, |b, rows| {
            b.iter(|| black_box(process_batch(&step, rows.clone()).unwrap()));
        });
    }
    group.finish();
}

fn identity_benchmark(c: &mut Criterion) {
    let value = json!({"x": 42, "label": "row-42", "tags": ["a", "b", "c"], "score": 0.5});
    c.bench_function("identity_hash", |b| b.iter(|| identity_hash(black_box(&value))));
}

criterion_group!(benches, batch_benchmark, identity_benchmark);
criterion_main!(benches);
