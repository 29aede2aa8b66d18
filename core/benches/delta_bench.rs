use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshkit_core::crdt::{CrdtKind, CrdtValue, PnCounter};
use meshkit_core::optimizer::{compress, OutboundDelta};
use meshkit_core::protocol::serialize::serialize_delta;
use meshkit_core::replica::{DeltaLog, ReplicaStore};

fn pending(objects: usize, per_object: usize) -> Vec<OutboundDelta> {
    let mut counters = vec![PnCounter::new(); objects];
    let mut out = Vec::with_capacity(objects * per_object);
    for seq in 0..per_object {
        for (i, counter) in counters.iter_mut().enumerate() {
            out.push(OutboundDelta {
                object_id: format!("obj-{}", i),
                delta: CrdtValue::from(counter.increment("r1", 1)),
                origin: "r1".to_string(),
                origin_seqs: vec![(seq * objects + i + 1) as u64],
                hops: 0,
            });
        }
    }
    out
}

/// Benchmark pre-send compression of pending deltas
fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_compress");

    for per_object in [1, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(per_object),
            per_object,
            |b, &per_object| {
                b.iter_batched(
                    || pending(50, per_object),
                    |deltas| black_box(compress(deltas).unwrap()),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Benchmark wire encoding of a batch
fn bench_serialize(c: &mut Criterion) {
    let deltas = pending(100, 1);
    c.bench_function("serialize_100_deltas", |b| {
        b.iter(|| {
            for delta in &deltas {
                black_box(serialize_delta(delta).unwrap());
            }
        });
    });
}

/// Benchmark the local mutation path (lock, mutate, validate, log)
fn bench_store_mutate(c: &mut Criterion) {
    c.bench_function("store_mutate_1k", |b| {
        b.iter_batched(
            || {
                let store = ReplicaStore::new("r1");
                store.create_empty("views", CrdtKind::PnCounter).unwrap();
                store
            },
            |store| {
                for _ in 0..1000 {
                    store
                        .mutate("views", |c: &mut PnCounter, r, _| Ok(c.increment(r, 1)))
                        .unwrap();
                }
                black_box(store.with_log(|log: &mut DeltaLog| log.head()));
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_compress, bench_serialize, bench_store_mutate);

criterion_main!(benches);
