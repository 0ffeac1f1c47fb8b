//! A flash sale from preload to persisted orders.
//!
//! 1. Create an activity with 5 units and preload its stock
//! 2. Open the sale and let 50 users race for the units
//! 3. Let the reconciliation worker persist the winners' orders
//! 4. Close the sale and clear its cache entries

use demos::{sale_starting_now, setup_logger};
use seckill_rs::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logger();
    info!("=== Flash Sale Demo ===");

    let manager = Arc::new(MemorySeckillManager::in_memory(SeckillConfig::default())?);
    let worker = manager.start_worker()?;
    let activity_id = ActivityId(1);

    // Step 1
    manager
        .repository()
        .insert_activity(sale_starting_now(1, 5, 9_900));
    let loaded = manager.preload_stock(activity_id, 5).await?;
    info!(loaded, "stock preloaded");

    // Step 2
    manager.advance_statuses(current_time_millis());
    let mut attempts = Vec::new();
    for user in 1..=50 {
        let manager = Arc::clone(&manager);
        attempts.push(tokio::spawn(async move {
            (user, manager.seckill(UserId(user), activity_id).await)
        }));
    }

    let mut winners = Vec::new();
    let mut sold_out = 0;
    for attempt in attempts {
        let (user, outcome) = attempt.await?;
        match outcome? {
            SeckillOutcome::Won { idempotency_key } => {
                info!(user, key = %idempotency_key, "won");
                winners.push(user);
            }
            SeckillOutcome::OutOfStock => sold_out += 1,
            other => info!(user, %other, "rejected"),
        }
    }
    info!(winners = winners.len(), sold_out, "admission finished");

    // A second try by a winner is rejected without touching stock.
    if let Some(&user) = winners.first() {
        let again = manager.seckill(UserId(user), activity_id).await?;
        info!(user, %again, "second attempt");
    }

    // Step 3
    while manager.worker().persisted_count() < winners.len() as u64 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for order in manager.repository().orders_for(activity_id) {
        info!(
            order_no = %order.order_no,
            user = %order.user_id,
            price = order.price,
            status = ?order.status,
            "order"
        );
    }

    // Step 4
    manager
        .repository()
        .set_status(activity_id, ActivityStatus::Closed)?;
    manager.reset_activity(activity_id).await?;
    worker.shutdown().await;

    info!("=== Demo Complete ===");
    Ok(())
}
