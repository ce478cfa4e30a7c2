use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use creg_script::{script_registry, Interpreter, NativeRegistry, ScriptOptions, Value};

/// Interpreter with `n` global tables, each holding an array part, a few
/// string keys and a back pointer to the previous table
fn populated(n: usize) -> Interpreter {
    let mut interp = Interpreter::new(
        script_registry().unwrap(),
        Arc::new(NativeRegistry::new()),
        ScriptOptions::default(),
    )
    .unwrap();
    let mut prev = Value::Nil;
    for i in 0..n {
        let table = interp.new_table().unwrap();
        for k in 1..=8 {
            interp
                .table_set(table, Value::Number(k as f64), Value::Number((i * k) as f64))
                .unwrap();
        }
        for key in ["name", "kind", "owner"] {
            let k = interp.intern(key).unwrap();
            let v = interp.intern(format!("{key}-{}", i % 64)).unwrap();
            interp.table_set(table, k.into(), v.into()).unwrap();
        }
        let back = interp.intern("prev").unwrap();
        interp.table_set(table, back.into(), prev).unwrap();
        prev = Value::Table(table);
        interp.set_global(&format!("t{i}"), prev.clone()).unwrap();
    }
    interp
}

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_save");
    for n in [10usize, 100, 1_000] {
        let mut interp = populated(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("tables", n), &n, |b, _| {
            b.iter(|| {
                let mut bytes = Vec::new();
                interp.save(black_box(&mut bytes)).unwrap();
                bytes
            });
        });
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let registry = script_registry().unwrap();
    let natives = Arc::new(NativeRegistry::new());
    let mut group = c.benchmark_group("state_load");
    for n in [10usize, 100, 1_000] {
        let mut bytes = Vec::new();
        populated(n).save(&mut bytes).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("tables", n), &bytes, |b, bytes| {
            b.iter(|| {
                Interpreter::load(
                    &registry,
                    natives.clone(),
                    ScriptOptions::default(),
                    black_box(bytes),
                )
                .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save, bench_load);
criterion_main!(benches);
