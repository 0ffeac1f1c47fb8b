use criterion::Criterion;
use seckill_rs::prelude::*;
use std::hint::black_box;

/// Register benchmarks for durable enqueue.
pub fn register_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Seckill - Order Queue");

    group.bench_function("enqueue_in_memory", |b| {
        let queue = OrderQueue::in_memory();
        let mut user = 0u64;
        b.iter(|| {
            user += 1;
            let reservation = Reservation::new(UserId(user), ActivityId(1), 0);
            black_box(queue.enqueue(&reservation))
        });
    });

    #[cfg(feature = "journal")]
    group.bench_function("enqueue_file_journal", |b| {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let queue = OrderQueue::open_file(dir.path(), 16 * 1024 * 1024)
            .unwrap_or_else(|e| panic!("open queue: {e}"));
        let mut user = 0u64;
        b.iter(|| {
            user += 1;
            let reservation = Reservation::new(UserId(user), ActivityId(1), 0);
            black_box(queue.enqueue(&reservation))
        });
    });

    group.finish();
}
