//! Metric kernel benchmarks
//!
//! Run with: cargo bench --bench metric

use clipdex_core::metric::{cosine_normalized, dot_product, l2_distance_squared, l2_normalized};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_vector(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn bench_kernels(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("metric");

    for dim in [128, 256, 512, 768] {
        group.throughput(Throughput::Elements(dim as u64));
        let a = l2_normalized(&random_vector(&mut rng, dim));
        let b = random_vector(&mut rng, dim);

        group.bench_function(format!("dot_product/dim_{}", dim), |bencher| {
            bencher.iter(|| dot_product(black_box(&a), black_box(&b)))
        });
        group.bench_function(format!("l2_distance_squared/dim_{}", dim), |bencher| {
            bencher.iter(|| l2_distance_squared(black_box(&a), black_box(&b)))
        });
        group.bench_function(format!("cosine_normalized/dim_{}", dim), |bencher| {
            bencher.iter(|| cosine_normalized(black_box(&a), black_box(&b)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_kernels);
criterion_main!(benches);
