//! Commit and search benchmarks
//!
//! Run with: cargo bench --bench commit

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::time::Duration;
use vecagent::{AgentConfig, IndexService};

const DIM: usize = 64;

fn random_vector(rng: &mut StdRng) -> Vec<f32> {
    (0..DIM).map(|_| rng.gen::<f32>() - 0.5).collect()
}

fn service() -> IndexService {
    IndexService::new(AgentConfig {
        dimension: DIM,
        ..AgentConfig::default()
    })
    .expect("in-memory service")
}

fn bench_insert_and_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_commit");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    for n in [100usize, 500, 1000] {
        let mut rng = StdRng::seed_from_u64(1000 + n as u64);
        let vectors: Vec<_> = (0..n).map(|_| random_vector(&mut rng)).collect();

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter_batched(
                service,
                |svc| {
                    for (i, v) in vectors.iter().enumerate() {
                        svc.insert(&format!("uuid-{i}"), v.clone()).expect("insert");
                    }
                    svc.create_index(4).expect("commit");
                    black_box(svc.object_count())
                },
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let svc = service();
    let mut rng = StdRng::seed_from_u64(4242);
    for i in 0..5000 {
        svc.insert(&format!("uuid-{i}"), random_vector(&mut rng))
            .expect("insert");
    }
    svc.create_index(4).expect("commit");

    let mut group = c.benchmark_group("search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(3));

    for k in [1usize, 10, 50] {
        let mut query_rng = StdRng::seed_from_u64(k as u64 + 5000);
        let query = random_vector(&mut query_rng);

        group.bench_with_input(BenchmarkId::from_parameter(k), &k, |b, &k| {
            b.iter(|| black_box(svc.search(&query, k, 0.1, -1.0).expect("search")))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert_and_commit, bench_search);
criterion_main!(benches);
