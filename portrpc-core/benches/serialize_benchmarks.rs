// Serializer and deserializer throughput

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use portrpc_core::{
    reconstruct_objects, serialize_fields, CapabilityEpoch, LongInt, MethodCache,
    ReconstructContext, SerializationInfo, TypeRegistry, Value,
};
use indexmap::IndexMap;
use serde_json::json;
use std::collections::HashMap;
use std::hint::black_box;

fn row(i: i64) -> Value {
    Value::dict([
        ("id", Value::Int(i)),
        ("name", Value::str(format!("row-{}", i))),
        ("score", Value::Float(i as f64 * 0.5)),
        ("tags", Value::List(vec![Value::str("a"), Value::str("b")])),
    ])
}

fn bench_plain_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize_plain");
    let types = TypeRegistry::new();

    for size in [1, 10, 100, 1000].iter() {
        let rows = Value::List((0..*size).map(row).collect());
        let mut fields = IndexMap::new();
        fields.insert("args".to_string(), Value::List(vec![rows]));

        group.bench_with_input(BenchmarkId::new("rows", size), &fields, |b, fields| {
            b.iter(|| {
                let mut info = SerializationInfo::new();
                black_box(serialize_fields(fields, &mut info, &types).ok())
            })
        });
    }

    group.finish();
}

fn bench_leaf_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize_leaves");
    let types = TypeRegistry::new();

    for size in [10, 100, 1000].iter() {
        let longs = Value::List(
            (0..*size)
                .map(|i| Value::Long(LongInt::parse(&format!("9{:030}", i)).unwrap_or(LongInt::from(0))))
                .collect(),
        );
        let mut fields = IndexMap::new();
        fields.insert("args".to_string(), longs);

        group.bench_with_input(BenchmarkId::new("longs", size), &fields, |b, fields| {
            b.iter(|| {
                let mut info = SerializationInfo::new();
                black_box(serialize_fields(fields, &mut info, &types).ok())
            })
        });
    }

    group.finish();
}

fn bench_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconstruct");
    let types = TypeRegistry::new();
    let methods = MethodCache::new();
    let epoch = CapabilityEpoch::new();
    let media = HashMap::new();

    for size in [10, 100, 1000].iter() {
        let objects: Vec<_> = (0..*size)
            .map(|i| json!({"path": ["response", i], "type": ["Date"], "value": "2024-01-01"}))
            .collect();
        let envelope = json!({
            "id": "bench",
            "response": vec![serde_json::Value::Null; *size],
            "objects": objects,
        });

        group.bench_with_input(BenchmarkId::new("dates", size), &envelope, |b, envelope| {
            let ctx = ReconstructContext {
                types: &types,
                methods: &methods,
                epoch: &epoch,
            };
            b.iter(|| black_box(reconstruct_objects(envelope, &media, &ctx).ok()))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_plain_serialization,
    bench_leaf_extraction,
    bench_reconstruction
);
criterion_main!(benches);
