//! Crash and restart scenarios over a file-backed order journal.

use seckill_rs::prelude::*;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const STOCK: u64 = 5;

fn config(dir: &Path) -> SeckillConfig {
    SeckillConfig::default()
        .with_journal_dir(dir)
        .with_journal_segment_size(64 * 1024)
        .with_worker_base_backoff_ms(1)
}

fn active_activity() -> Activity {
    let now = current_time_millis();
    Activity {
        id: ActivityId(1),
        product_id: ProductId(11),
        seckill_price: 2_500,
        seckill_stock: STOCK,
        start_time_ms: now.saturating_sub(60_000),
        end_time_ms: now.saturating_add(3_600_000),
        status: ActivityStatus::Active,
    }
}

/// Open a sale, admit `users` and return the manager without starting its
/// worker, so every reservation is still pending in the journal.
async fn admit_without_worker(
    config: SeckillConfig,
    repository: Arc<MemoryStore>,
    dedup: Arc<MemoryDedupStore>,
    users: &[u64],
) -> MemorySeckillManager {
    let stock = Arc::new(MemoryStockCounter::new());
    stock
        .preload_stock(ActivityId(1), STOCK)
        .await
        .expect("preload");
    let manager =
        SeckillManager::new(config, stock, dedup, repository).expect("build first manager");
    for &user in users {
        let outcome = manager.seckill(UserId(user), ActivityId(1)).await.expect("attempt");
        assert!(outcome.is_won(), "user {user} should win, got {outcome}");
    }
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

#[tokio::test]
async fn pending_reservations_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(MemoryStore::new());
    repository.insert_activity(active_activity());

    let first = admit_without_worker(
        config(dir.path()),
        Arc::clone(&repository),
        Arc::new(MemoryDedupStore::new()),
        &[1, 2, 3],
    )
    .await;
    drop(first);

    // Restart with the cache tier wiped and no orders written.
    let fresh_repository = Arc::new(MemoryStore::new());
    fresh_repository.insert_activity(active_activity());
    let manager = SeckillManager::new(
        config(dir.path()),
        Arc::new(MemoryStockCounter::new()),
        Arc::new(MemoryDedupStore::new()),
        Arc::clone(&fresh_repository),
    )
    .expect("build second manager");

    let reports = manager.recover(&[ActivityId(1)]).await.expect("recover");
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.persisted_orders, 0);
    assert_eq!(report.pending_reservations, 3);
    assert_eq!(report.admitted, 3);
    assert_eq!(report.counter_before, None);
    assert_eq!(report.counter_after, STOCK - 3);
    assert_eq!(report.remarked, 3);
    assert_eq!(report.redelivered, 3);
    assert!(report.drift_detected());

    let handle = manager.start_worker().expect("start worker");
    wait_for_persisted(&manager, 3).await;
    assert_eq!(fresh_repository.orders_for(ActivityId(1)).len(), 3);

    assert_eq!(
        manager.seckill(UserId(1), ActivityId(1)).await.ok(),
        Some(SeckillOutcome::AlreadyPurchased)
    );
    assert!(
        manager
            .seckill(UserId(4), ActivityId(1))
            .await
            .map(|o| o.is_won())
            .unwrap_or(false)
    );
    assert_eq!(
        manager.engine().peek_stock(ActivityId(1)).await.ok().flatten(),
        Some(STOCK - 4)
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn partial_persistence_is_completed_and_stale_marks_removed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(MemoryStore::new());
    repository.insert_activity(active_activity());
    let dedup = Arc::new(MemoryDedupStore::new());

    let first = admit_without_worker(
        config(dir.path()),
        Arc::clone(&repository),
        Arc::clone(&dedup),
        &[1, 2],
    )
    .await;

    // Only the first reservation reaches the database before the crash.
    let mut consumer = first.queue().take_consumer().expect("consumer");
    let delivery = consumer.try_recv().expect("delivery");
    assert!(first.worker().process(&delivery).await.is_ok());
    drop(consumer);
    drop(first);

    // A request interrupted between its mark and its enqueue.
    assert!(
        dedup
            .try_mark_purchased(ActivityId(1), UserId(9))
            .await
            .unwrap_or(false)
    );

    let manager = SeckillManager::new(
        config(dir.path()),
        Arc::new(MemoryStockCounter::new()),
        Arc::clone(&dedup),
        Arc::clone(&repository),
    )
    .expect("build second manager");

    let reports = manager.recover(&[ActivityId(1)]).await.expect("recover");
    let report = &reports[0];
    assert_eq!(report.persisted_orders, 1);
    assert_eq!(report.pending_reservations, 1);
    assert_eq!(report.admitted, 2);
    assert_eq!(report.counter_after, STOCK - 2);
    assert_eq!(report.remarked, 0);
    assert_eq!(report.stale_marks_removed, 1);
    assert_eq!(report.redelivered, 1);

    let handle = manager.start_worker().expect("start worker");
    wait_for_persisted(&manager, 1).await;
    handle.shutdown().await;

    let orders = repository.orders_for(ActivityId(1));
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.status == OrderStatus::Confirmed));
    assert_eq!(repository.audit_stock(ActivityId(1)), Some(STOCK - 2));
    assert!(manager.queue().pending().expect("pending").is_empty());

    // User 9 never held a unit and may now try again.
    assert!(
        manager
            .seckill(UserId(9), ActivityId(1))
            .await
            .map(|o| o.is_won())
            .unwrap_or(false)
    );
}

#[tokio::test]
async fn recovery_compacts_the_journal_and_keeps_pending_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repository = Arc::new(MemoryStore::new());
    repository.insert_activity(active_activity());
    let dedup = Arc::new(MemoryDedupStore::new());

    let first = admit_without_worker(
        config(dir.path()),
        Arc::clone(&repository),
        Arc::clone(&dedup),
        &[1, 2, 3],
    )
    .await;
    let mut consumer = first.queue().take_consumer().expect("consumer");
    for _ in 0..2 {
        let delivery = consumer.try_recv().expect("delivery");
        assert!(first.worker().process(&delivery).await.is_ok());
    }
    // Three enqueues and two acknowledgements.
    assert_eq!(first.queue().last_sequence(), Some(4));

    let reports = first.recover(&[ActivityId(1)]).await.expect("recover");
    assert_eq!(reports[0].pending_reservations, 1);
    // User 3's reservation was copied past the acknowledged history.
    assert_eq!(first.queue().last_sequence(), Some(5));
    drop(consumer);
    drop(first);

    let manager = SeckillManager::new(
        config(dir.path()),
        Arc::new(MemoryStockCounter::new()),
        Arc::clone(&dedup),
        Arc::clone(&repository),
    )
    .expect("build second manager");
    let pending = manager.queue().pending().expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].reservation.user_id, UserId(3));

    let reports = manager.recover(&[ActivityId(1)]).await.expect("recover again");
    assert_eq!(reports[0].admitted, 3);
    assert_eq!(reports[0].counter_after, STOCK - 3);
    // Already compact: nothing is copied a second time.
    assert_eq!(manager.queue().last_sequence(), Some(5));

    let handle = manager.start_worker().expect("start worker");
    wait_for_persisted(&manager, 1).await;
    handle.shutdown().await;
    assert_eq!(repository.orders_for(ActivityId(1)).len(), 3);
    assert!(manager.queue().pending().expect("pending").is_empty());
}

#[tokio::test]
async fn recovery_of_unknown_activity_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = MemorySeckillManager::in_memory(config(dir.path())).expect("manager");
    assert!(matches!(
        manager.recover(&[ActivityId(77)]).await,
        Err(SeckillError::ActivityNotFound { .. })
    ));
}
