use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use creg_core::{
    load_package, member, save_package, ClassBuilder, ClassRegistry, ObjRef, ObjectGraph, Ptr,
    Reflect, RegistryBuilder,
};

#[derive(Default)]
struct Cell {
    value: i64,
    name: String,
    next: Ptr<Cell>,
    neighbours: Vec<Ptr<Cell>>,
}

impl Reflect for Cell {
    const CLASS: &'static str = "Cell";
}

fn registry() -> Arc<ClassRegistry> {
    Arc::new(
        RegistryBuilder::new()
            .with(
                ClassBuilder::<Cell>::new()
                    .field(member!(Cell, value))
                    .field(member!(Cell, name))
                    .field(member!(Cell, next))
                    .field(member!(Cell, neighbours))
                    .build(),
            )
            .unwrap()
            .finalize()
            .unwrap(),
    )
}

/// Ring of `n` cells, each also pointing a few cells ahead
fn ring(registry: &Arc<ClassRegistry>, n: usize) -> (ObjectGraph, ObjRef) {
    let mut graph = ObjectGraph::new(registry.clone());
    let cells: Vec<Ptr<Cell>> = (0..n)
        .map(|i| {
            graph
                .insert(Cell {
                    value: i as i64,
                    name: format!("cell-{i}"),
                    ..Default::default()
                })
                .unwrap()
        })
        .collect();
    for i in 0..n {
        let cell = graph.get_mut(cells[i]).unwrap();
        cell.next = cells[(i + 1) % n];
        cell.neighbours = (2..5).map(|k| cells[(i + k) % n]).collect();
    }
    (graph, cells[0].raw().unwrap())
}

fn bench_save(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("save");
    for n in [100usize, 1_000, 10_000] {
        let (mut graph, root) = ring(&registry, n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("ring", n), &n, |b, _| {
            b.iter(|| save_package(&mut graph, black_box(root)).unwrap());
        });
    }
    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let registry = registry();
    let mut group = c.benchmark_group("load");
    for n in [100usize, 1_000, 10_000] {
        let (mut graph, root) = ring(&registry, n);
        let bytes = save_package(&mut graph, root).unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("ring", n), &bytes, |b, bytes| {
            b.iter(|| load_package(&registry, black_box(bytes)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save, bench_load);
criterion_main!(benches);
