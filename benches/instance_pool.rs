//! Instance pool benchmarks.

use cistern::engine::BackendRegistry;
use cistern::instance::{InstancePool, InstancePoolConfig, PoolResources, SchedulingStrategy};
use cistern::memory::{MemoryPool, MemoryPoolConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::io::Write;
use std::sync::Arc;

fn model_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0u8; 4096]).unwrap();
    file
}

fn pool(file: &tempfile::NamedTempFile, strategy: SchedulingStrategy, instances: usize) -> InstancePool {
    let memory = MemoryPool::new(MemoryPoolConfig::default().with_initial_size(8 * 1024 * 1024)).unwrap();
    let resources = PoolResources::new(memory, Arc::new(BackendRegistry::with_defaults()));
    InstancePool::new(
        InstancePoolConfig::new("bench", file.path())
            .with_instances(instances, instances)
            .with_strategy(strategy)
            .with_private_memory(4096),
        resources,
    )
    .unwrap()
}

fn bench_acquire_release(c: &mut Criterion) {
    let file = model_file();
    let mut group = c.benchmark_group("acquire_release");

    for strategy in [
        SchedulingStrategy::RoundRobin,
        SchedulingStrategy::LeastLoaded,
        SchedulingStrategy::Random,
        SchedulingStrategy::Priority,
    ] {
        let pool = pool(&file, strategy, 8);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(strategy), &pool, |b, pool| {
            b.iter(|| {
                let lease = pool.try_acquire().unwrap();
                std::hint::black_box(lease.id());
            });
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let file = model_file();
    let mut group = c.benchmark_group("contended_infer");

    for instances in [1usize, 4] {
        let pool = Arc::new(pool(&file, SchedulingStrategy::LeastLoaded, instances));
        group.throughput(Throughput::Elements(400));
        group.bench_with_input(BenchmarkId::from_parameter(instances), &pool, |b, pool| {
            b.iter(|| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let pool = Arc::clone(pool);
                        std::thread::spawn(move || {
                            let input = [0u8; 64];
                            let mut outputs = Vec::new();
                            for _ in 0..100 {
                                let lease = pool.acquire(None).unwrap();
                                lease.infer(&[&input[..]], &mut outputs).unwrap();
                            }
                        })
                    })
                    .collect();

                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_contended);
criterion_main!(benches);
