use criterion::{BatchSize, BenchmarkId, Criterion};
use seckill_rs::prelude::*;
use std::hint::black_box;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("runtime: {e}"))
}

async fn open_sale(stock: u64) -> Arc<MemorySeckillManager> {
    let manager = MemorySeckillManager::in_memory(SeckillConfig::default())
        .unwrap_or_else(|e| panic!("manager: {e}"));
    let now = current_time_millis();
    manager.repository().insert_activity(Activity {
        id: ActivityId(1),
        product_id: ProductId(1),
        seckill_price: 100,
        seckill_stock: stock,
        start_time_ms: now.saturating_sub(60_000),
        end_time_ms: now.saturating_add(3_600_000),
        status: ActivityStatus::Pending,
    });
    let _ = manager.preload_stock(ActivityId(1), stock).await;
    manager.advance_statuses(now);
    Arc::new(manager)
}

/// Register benchmarks for the stock counter and the full admission path.
pub fn register_benchmarks(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("Seckill - Admission");

    group.bench_function("memory_try_decrement", |b| {
        let counter = MemoryStockCounter::new();
        rt.block_on(counter.preload_stock(ActivityId(1), u64::MAX));
        b.iter(|| rt.block_on(counter.try_decrement(black_box(ActivityId(1)))));
    });

    group.bench_function("memory_try_mark_purchased", |b| {
        let dedup = MemoryDedupStore::new();
        let mut user = 0u64;
        b.iter(|| {
            user += 1;
            rt.block_on(dedup.try_mark_purchased(ActivityId(1), black_box(UserId(user))))
        });
    });

    // Sold out: the common case once a sale has started.
    group.bench_function("seckill_out_of_stock", |b| {
        let manager = rt.block_on(open_sale(0));
        let mut user = 0u64;
        b.iter(|| {
            user += 1;
            rt.block_on(manager.seckill(black_box(UserId(user)), ActivityId(1)))
        });
    });

    // Contended sale: `concurrency` users race for `concurrency / 10` units.
    for &concurrency in &[100u64, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("seckill_contended", concurrency),
            &concurrency,
            |b, &count| {
                b.iter_batched(
                    || rt.block_on(open_sale(count / 10)),
                    |manager| {
                        rt.block_on(async {
                            let mut tasks = Vec::with_capacity(count as usize);
                            for user in 0..count {
                                let manager = Arc::clone(&manager);
                                tasks.push(tokio::spawn(async move {
                                    manager.seckill(UserId(user), ActivityId(1)).await
                                }));
                            }
                            for task in tasks {
                                let _ = black_box(task.await);
                            }
                        });
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}
