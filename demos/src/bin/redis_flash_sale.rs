//! The admission path against a shared Redis instance.
//!
//! Requires `REDIS_URL` (default `redis://127.0.0.1/`). Several processes
//! running this binary share one stock counter and one purchase set.

use demos::{sale_starting_now, setup_logger};
use seckill_rs::prelude::*;
use seckill_rs::{RedisDedupStore, RedisStockCounter};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logger();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    info!(%url, "=== Redis Flash Sale Demo ===");

    let manager = SeckillManager::new(
        SeckillConfig::default(),
        Arc::new(RedisStockCounter::new(&url).await?),
        Arc::new(RedisDedupStore::new(&url).await?),
        Arc::new(MemoryStore::new()),
    )?;
    let activity_id = ActivityId(42);
    manager
        .repository()
        .insert_activity(sale_starting_now(42, 3, 5_000));
    manager.reset_activity(activity_id).await?;
    manager.preload_stock(activity_id, 3).await?;
    manager
        .repository()
        .set_status(activity_id, ActivityStatus::Active)?;
    manager.engine().oracle().invalidate(activity_id);

    for user in 1..=5 {
        let outcome = manager.seckill(UserId(user), activity_id).await?;
        info!(user, %outcome, "attempt");
    }
    info!(
        remaining = ?manager.engine().peek_stock(activity_id).await?,
        "=== Demo Complete ==="
    );
    Ok(())
}
