//! Reservations survive a crash through the file journal.
//!
//! The first manager admits three users and stops before any order is
//! written. A second manager opens the same journal with empty caches,
//! reconciles the activity and persists the pending orders.

use demos::{sale_starting_now, setup_logger};
use seckill_rs::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logger();
    info!("=== Crash Recovery Demo ===");

    let dir = std::env::temp_dir().join(format!("seckill-demo-{}", std::process::id()));
    let config = SeckillConfig::default()
        .with_journal_dir(&dir)
        .with_journal_segment_size(1024 * 1024);
    let repository = Arc::new(MemoryStore::new());
    repository.insert_activity(sale_starting_now(1, 10, 1_500));

    {
        let before = SeckillManager::new(
            config.clone(),
            Arc::new(MemoryStockCounter::new()),
            Arc::new(MemoryDedupStore::new()),
            Arc::clone(&repository),
        )?;
        before.preload_stock(ActivityId(1), 10).await?;
        before.advance_statuses(current_time_millis());
        for user in 1..=3 {
            let outcome = before.seckill(UserId(user), ActivityId(1)).await?;
            info!(user, %outcome, "admitted before crash");
        }
        info!(pending = before.queue().pending()?.len(), "crashing");
    }

    let after = SeckillManager::new(
        config,
        Arc::new(MemoryStockCounter::new()),
        Arc::new(MemoryDedupStore::new()),
        Arc::clone(&repository),
    )?;
    for report in after.recover(&[ActivityId(1)]).await? {
        info!("{}", serde_json::to_string_pretty(&report)?);
    }

    let worker = after.start_worker()?;
    while after.worker().persisted_count() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.shutdown().await;
    info!(
        orders = repository.orders_for(ActivityId(1)).len(),
        remaining = ?after.engine().peek_stock(ActivityId(1)).await?,
        "recovered"
    );

    std::fs::remove_dir_all(&dir)?;
    info!("=== Demo Complete ===");
    Ok(())
}
