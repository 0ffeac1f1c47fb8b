//! Property tests: no oversell, no double win, stock accounting is exact.

use proptest::prelude::*;
use seckill_rs::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime")
}

async fn open_sale(stock: u64) -> Arc<MemorySeckillManager> {
    let manager = MemorySeckillManager::in_memory(SeckillConfig::default()).expect("manager");
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
    manager.preload_stock(ActivityId(1), stock).await.expect("preload");
    manager.advance_statuses(now);
    Arc::new(manager)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_attempts_never_oversell(
        stock in 0u64..12,
        users in prop::collection::vec(1u64..20, 0..40),
    ) {
        let rt = runtime();
        let (winners, rejected, remaining, pending) = rt.block_on(async {
            let manager = open_sale(stock).await;
            let mut tasks = Vec::with_capacity(users.len());
            for &user in &users {
                let manager = Arc::clone(&manager);
                tasks.push(tokio::spawn(async move {
                    let outcome = manager.seckill(UserId(user), ActivityId(1)).await;
                    (user, outcome)
                }));
            }

            let mut winners = Vec::new();
            let mut rejected = 0usize;
            for task in tasks {
                let (user, outcome) = task.await.expect("task joined");
                match outcome.expect("no infrastructure error") {
                    SeckillOutcome::Won { .. } => winners.push(user),
                    SeckillOutcome::OutOfStock | SeckillOutcome::AlreadyPurchased => {
                        rejected += 1;
                    }
                    SeckillOutcome::NotOpen => panic!("sale should be open"),
                }
            }
            let remaining = manager
                .engine()
                .peek_stock(ActivityId(1))
                .await
                .ok()
                .flatten()
                .unwrap_or(u64::MAX);
            let pending = manager.queue().pending().expect("pending").len();
            (winners, rejected, remaining, pending)
        });

        let distinct: HashSet<u64> = users.iter().copied().collect();
        let unique_winners: HashSet<u64> = winners.iter().copied().collect();

        prop_assert_eq!(unique_winners.len(), winners.len());
        prop_assert_eq!(winners.len() as u64, stock.min(distinct.len() as u64));
        prop_assert_eq!(winners.len() + rejected, users.len());
        prop_assert_eq!(remaining, stock - winners.len() as u64);
        prop_assert_eq!(pending, winners.len());
    }

    #[test]
    fn admission_is_decided_by_the_window(
        offset_ms in -120_000i64..120_000,
        status in prop_oneof![
            Just(ActivityStatus::Pending),
            Just(ActivityStatus::Active),
            Just(ActivityStatus::Closed),
        ],
    ) {
        let now = 1_000_000_000u64;
        let start = now.saturating_add_signed(offset_ms);
        let activity = Activity {
            id: ActivityId(1),
            product_id: ProductId(1),
            seckill_price: 1,
            seckill_stock: 1,
            start_time_ms: start,
            end_time_ms: start.saturating_add(60_000),
            status,
        };
        let open = activity.admission_state_at(now).is_open();
        let expected = status == ActivityStatus::Active
            && now >= activity.start_time_ms
            && now < activity.end_time_ms;
        prop_assert_eq!(open, expected);
    }
}
