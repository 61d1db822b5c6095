//! Histogram observe, quantile and codec throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use histdb_core::HistogramStore;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

fn samples(n: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..n).map(|_| rng.gen_range(0.0f32..10_000.0)).collect()
}

fn bench_observe(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe");
    for size in [1_000usize, 100_000] {
        let data = samples(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("single", size), &data, |b, data| {
            b.iter(|| {
                let store = HistogramStore::new();
                let h = store.new_histogram();
                for v in data {
                    store.observe(h, *v);
                }
                store.finalize();
                black_box(store.total(h))
            })
        });
    }
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let store = HistogramStore::new();
    let h = store.new_histogram();
    for v in samples(100_000) {
        store.observe(h, v);
    }
    store.finalize();
    let bytes = store.serialize(h);

    let mut group = c.benchmark_group("read");
    group.bench_function("quantile_p99", |b| b.iter(|| black_box(store.quantile(h, 0.99))));
    group.bench_function("summary", |b| b.iter(|| black_box(store.summary(h))));
    group.bench_function("serialize", |b| b.iter(|| black_box(store.serialize(h))));
    group.bench_function("merge_bytes", |b| {
        b.iter(|| {
            let out = HistogramStore::new();
            let dst = out.new_histogram();
            out.merge_bytes(dst, &bytes).ok();
            black_box(out.total(dst))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_observe, bench_read);
criterion_main!(benches);
