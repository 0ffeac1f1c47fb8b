//! Integration tests for the admission path and the order pipeline behind it.

use seckill_rs::prelude::*;
use seckill_rs::{
    ActivityWindowOracle, Journal, JournalError, JournalReadIter, JournalRecord, MemoryJournal,
};
use seckill_rs::seckill::QueueRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn activity(id: u64, stock: u64, start_offset_ms: i64) -> Activity {
    let now = current_time_millis();
    let start = if start_offset_ms < 0 {
        now.saturating_sub(start_offset_ms.unsigned_abs())
    } else {
        now.saturating_add(start_offset_ms.unsigned_abs())
    };
    Activity {
        id: ActivityId(id),
        product_id: ProductId(100 + id),
        seckill_price: 4_999,
        seckill_stock: stock,
        start_time_ms: start,
        end_time_ms: now.saturating_add(3_600_000),
        status: ActivityStatus::Pending,
    }
}

/// A manager with one activity preloaded and admitting.
async fn open_sale(stock: u64) -> MemorySeckillManager {
    let manager = MemorySeckillManager::in_memory(SeckillConfig::default())
        .expect("build manager");
    manager.repository().insert_activity(activity(1, stock, -60_000));
    manager
        .preload_stock(ActivityId(1), stock)
        .await
        .expect("preload before open");
    manager.advance_statuses(current_time_millis());
    manager
}

async fn wait_for_persisted(manager: &MemorySeckillManager, expected: u64) {
    for _ in 0..500 {
        if manager.worker().persisted_count() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "worker persisted {} orders, expected {expected}",
        manager.worker().persisted_count()
    );
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_units_ten_users_three_winners() {
    let manager = Arc::new(open_sale(3).await);
    let handle = manager.start_worker().expect("start worker");

    let mut tasks = Vec::new();
    for user in 1..=10 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager.seckill(UserId(user), ActivityId(1)).await
        }));
    }

    let mut won = 0;
    let mut out_of_stock = 0;
    for task in tasks {
        match task.await.expect("task joined").expect("no infrastructure error") {
            SeckillOutcome::Won { .. } => won += 1,
            SeckillOutcome::OutOfStock => out_of_stock += 1,
            other => panic!("unexpected outcome {other}"),
        }
    }
    assert_eq!(won, 3);
    assert_eq!(out_of_stock, 7);
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), Some(0));

    wait_for_persisted(&manager, 3).await;
    let orders = manager.repository().orders_for(ActivityId(1));
    assert_eq!(orders.len(), 3);
    assert!(orders.iter().all(|o| o.status == OrderStatus::Confirmed));
    assert!(orders.iter().all(|o| o.price == 4_999));
    assert_eq!(manager.repository().audit_stock(ActivityId(1)), Some(0));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_user_racing_wins_once() {
    let manager = Arc::new(open_sale(5).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        tasks.push(tokio::spawn(async move {
            manager.seckill(UserId(7), ActivityId(1)).await
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.expect("task joined").expect("no infrastructure error"));
    }
    assert_eq!(outcomes.iter().filter(|o| o.is_won()).count(), 1);
    assert!(
        outcomes
            .iter()
            .filter(|o| !o.is_won())
            .all(|o| *o == SeckillOutcome::AlreadyPurchased)
    );
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), Some(4));
}

// ---------------------------------------------------------------------------
// Sequential scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn won_then_already_purchased() {
    let manager = open_sale(10).await;

    let first = manager.seckill(UserId(1), ActivityId(1)).await.expect("first attempt");
    let key = match first {
        SeckillOutcome::Won { idempotency_key } => idempotency_key,
        other => panic!("expected a win, got {other}"),
    };
    assert_eq!(key, IdempotencyKey::derive(ActivityId(1), UserId(1)));

    let second = manager.seckill(UserId(1), ActivityId(1)).await.expect("second attempt");
    assert_eq!(second, SeckillOutcome::AlreadyPurchased);
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), Some(9));
}

#[tokio::test]
async fn preloaded_but_not_started_is_not_open() {
    let manager = MemorySeckillManager::in_memory(SeckillConfig::default())
        .expect("build manager");
    manager.repository().insert_activity(activity(2, 4, 60_000));

    assert_eq!(manager.preload_stock(ActivityId(2), 4).await.ok(), Some(4));
    // Repeating the preload before the start is harmless.
    assert_eq!(manager.preload_stock(ActivityId(2), 4).await.ok(), Some(4));

    let outcome = manager.seckill(UserId(1), ActivityId(2)).await.expect("attempt");
    assert_eq!(outcome, SeckillOutcome::NotOpen);
    assert_eq!(manager.engine().peek_stock(ActivityId(2)).await.ok().flatten(), Some(4));
    assert_eq!(manager.queue().last_sequence(), None);
}

#[tokio::test]
async fn closed_and_unknown_activities_are_not_open() {
    let manager = open_sale(2).await;
    manager
        .repository()
        .set_status(ActivityId(1), ActivityStatus::Closed)
        .expect("close");
    manager.engine().oracle().invalidate(ActivityId(1));

    assert_eq!(
        manager.seckill(UserId(1), ActivityId(1)).await.ok(),
        Some(SeckillOutcome::NotOpen)
    );
    assert_eq!(
        manager.seckill(UserId(1), ActivityId(404)).await.ok(),
        Some(SeckillOutcome::NotOpen)
    );
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), Some(2));
}

#[tokio::test]
async fn partial_allotment_caps_the_winners() {
    let manager = MemorySeckillManager::in_memory(SeckillConfig::default())
        .expect("build manager");
    manager.repository().insert_activity(activity(1, 10, -60_000));

    let refused = manager.preload_stock(ActivityId(1), 11).await;
    assert!(matches!(
        refused,
        Err(SeckillError::StockExceedsActivity {
            requested: 11,
            seckill_stock: 10,
            ..
        })
    ));
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), None);

    assert_eq!(manager.preload_stock(ActivityId(1), 2).await.ok(), Some(2));
    manager.advance_statuses(current_time_millis());

    let mut winners = 0;
    for user in 1..=5 {
        let outcome = manager.seckill(UserId(user), ActivityId(1)).await.expect("attempt");
        if outcome.is_won() {
            winners += 1;
        } else {
            assert_eq!(outcome, SeckillOutcome::OutOfStock);
        }
    }
    assert_eq!(winners, 2);
}

#[tokio::test]
async fn preload_refused_once_open() {
    let manager = open_sale(2).await;
    assert!(matches!(
        manager.preload_stock(ActivityId(1), 2).await,
        Err(SeckillError::PreloadWhileOpen { .. })
    ));
    assert!(matches!(
        manager.preload_stock(ActivityId(99), 2).await,
        Err(SeckillError::ActivityNotFound { .. })
    ));
}

#[tokio::test]
async fn worker_redelivery_creates_one_order() {
    let manager = open_sale(3).await;
    assert!(manager.seckill(UserId(5), ActivityId(1)).await.is_ok());

    // The same reservation arrives twice, as after a crash mid-acknowledge.
    let mut consumer = manager.queue().take_consumer().expect("consumer");
    let delivery = consumer.try_recv().expect("one delivery");
    let first = manager.worker().process(&delivery).await;
    let second = manager.worker().process(&delivery).await;

    assert!(matches!(first, Ok(seckill_rs::seckill::ProcessOutcome::Persisted)));
    assert!(matches!(second, Ok(seckill_rs::seckill::ProcessOutcome::Duplicate)));
    assert_eq!(manager.repository().orders_for(ActivityId(1)).len(), 1);
    assert_eq!(manager.repository().audit_stock(ActivityId(1)), Some(2));
    assert!(manager.queue().pending().expect("pending").is_empty());
}

#[tokio::test]
async fn reset_clears_cache_state_after_close() {
    let manager = open_sale(3).await;
    assert!(manager.seckill(UserId(1), ActivityId(1)).await.is_ok());
    assert!(matches!(
        manager.reset_activity(ActivityId(1)).await,
        Err(SeckillError::PreloadWhileOpen { .. })
    ));

    manager
        .repository()
        .set_status(ActivityId(1), ActivityStatus::Closed)
        .expect("close");
    assert!(manager.reset_activity(ActivityId(1)).await.is_ok());
    assert_eq!(manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(), None);
}

// ---------------------------------------------------------------------------
// Rollback on queue failure
// ---------------------------------------------------------------------------

/// A journal whose appends fail while `failing` is set.
struct SwitchableJournal {
    inner: MemoryJournal<QueueRecord>,
    failing: Arc<AtomicBool>,
}

impl Journal<QueueRecord> for SwitchableJournal {
    fn append(&self, record: &JournalRecord<QueueRecord>) -> Result<(), JournalError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(JournalError::Io {
                message: "disk full".to_string(),
                path: None,
            });
        }
        self.inner.append(record)
    }

    fn read_from(&self, sequence: u64) -> Result<JournalReadIter<QueueRecord>, JournalError> {
        self.inner.read_from(sequence)
    }

    fn last_sequence(&self) -> Option<u64> {
        self.inner.last_sequence()
    }

    fn verify_integrity(&self) -> Result<(), JournalError> {
        self.inner.verify_integrity()
    }
}

#[tokio::test]
async fn failed_enqueue_rolls_back_and_retry_succeeds() {
    let repository = Arc::new(MemoryStore::new());
    let mut open = activity(1, 2, -60_000);
    open.status = ActivityStatus::Active;
    repository.insert_activity(open);

    let failing = Arc::new(AtomicBool::new(true));
    let queue = Arc::new(OrderQueue::new(SwitchableJournal {
        inner: MemoryJournal::new(),
        failing: Arc::clone(&failing),
    }));
    let stock = Arc::new(MemoryStockCounter::new());
    let dedup = Arc::new(MemoryDedupStore::new());
    stock
        .preload_stock(ActivityId(1), 2)
        .await
        .expect("preload");
    let oracle = Arc::new(ActivityWindowOracle::new(Arc::clone(&repository), 1_000));
    let engine = ReservationEngine::new(oracle, Arc::clone(&stock), Arc::clone(&dedup), queue);

    let err = engine
        .seckill(UserId(3), ActivityId(1))
        .await
        .expect_err("append fails");
    assert!(err.is_retriable());
    assert_eq!(stock.peek_stock(ActivityId(1)).await.ok().flatten(), Some(2));
    assert_eq!(dedup.purchase_count(ActivityId(1)).await.ok(), Some(0));

    failing.store(false, Ordering::SeqCst);
    let retry = engine.seckill(UserId(3), ActivityId(1)).await.expect("retry");
    assert!(retry.is_won());
    assert_eq!(stock.peek_stock(ActivityId(1)).await.ok().flatten(), Some(1));
}
