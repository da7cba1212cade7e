use criterion::{criterion_group, criterion_main, Criterion};

use taskmill::{PoolMode, Priority, Scheduler, TaskPool};

fn pool_push_and_wait(c: &mut Criterion) {
    let scheduler = Scheduler::builder().with_worker_threads(4).build();

    c.bench_function("pool push+wait 1000", |b| {
        b.iter(|| {
            let pool = TaskPool::new(&scheduler, PoolMode::Suspended);
            for _ in 0..1000 {
                pool.push(Priority::High, |_| {});
            }
            pool.work_and_wait();
        });
    });

    scheduler.shut_down().wait();
}

fn parallel_range_sum(c: &mut Criterion) {
    let scheduler = Scheduler::builder().with_worker_threads(4).build();

    c.bench_function("parallel range sum 1M", |b| {
        b.iter(|| {
            let sum = scheduler
                .range(0..1_000_000)
                .with_local(0u64)
                .with_reduce(|into, chunk| *into += chunk)
                .run(|i, acc| *acc += i as u64);
            criterion::black_box(sum)
        });
    });

    scheduler.shut_down().wait();
}

criterion_group!(benches, pool_push_and_wait, parallel_range_sum);
criterion_main!(benches);
