//! Shared setup for the demo binaries.

use seckill_rs::prelude::*;

/// Install a `tracing` fmt subscriber at `INFO`.
pub fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .try_init();
}

/// An activity that started a minute ago and runs for an hour, still marked
/// `Pending` so its stock can be preloaded.
pub fn sale_starting_now(id: u64, stock: u64, price: u64) -> Activity {
    let now = current_time_millis();
    Activity {
        id: ActivityId(id),
        product_id: ProductId(1_000 + id),
        seckill_price: price,
        seckill_stock: stock,
        start_time_ms: now.saturating_sub(60_000),
        end_time_ms: now.saturating_add(3_600_000),
        status: ActivityStatus::Pending,
    }
}
