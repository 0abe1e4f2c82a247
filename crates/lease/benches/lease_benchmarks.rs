use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use conductor_lease::LeaseManager;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_acquire_release");
    group.throughput(Throughput::Elements(1));

    group.bench_function("uncontended", |b| {
        let manager = LeaseManager::in_memory();
        b.iter(|| {
            rt.block_on(async {
                let mut lease = manager
                    .try_acquire_non_blocking::<u64>(black_box("parties"))
                    .await
                    .unwrap();
                manager.release(&mut lease).await.unwrap();
            })
        });
    });

    group.bench_function("contended", |b| {
        let manager = LeaseManager::in_memory();
        let mut holder = rt
            .block_on(manager.try_acquire_non_blocking::<u64>("roles"))
            .unwrap();
        b.iter(|| {
            rt.block_on(async {
                let lease = manager
                    .try_acquire_non_blocking::<u64>(black_box("roles"))
                    .await
                    .unwrap();
                black_box(lease.has_lease());
            })
        });
        rt.block_on(manager.release(&mut holder)).unwrap();
    });

    group.finish();
}

fn bench_many_names(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_registry_size");

    for names in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*names as u64));
        group.bench_with_input(BenchmarkId::from_parameter(names), names, |b, &names| {
            let manager = LeaseManager::in_memory();
            let keys: Vec<String> = (0..names).map(|i| format!("group-{i}")).collect();
            b.iter(|| {
                rt.block_on(async {
                    for key in &keys {
                        let mut lease = manager.try_acquire_non_blocking::<u64>(key).await.unwrap();
                        manager.put(&mut lease, 1).await.unwrap();
                        manager.release(&mut lease).await.unwrap();
                    }
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_many_names);
criterion_main!(benches);
