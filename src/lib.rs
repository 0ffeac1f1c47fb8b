//! # Flash-Sale (Seckill) Admission Engine
//!
//! Admission control for time-boxed sales of scarce stock: given a fixed
//! number of units and a flood of near-simultaneous purchase attempts, admit
//! at most that many winners, never the same user twice, and never oversell,
//! while answering each request without waiting for the order to be written.
//!
//! ## Key Features
//!
//! - **Atomic Stock Reservation**: decrement-if-positive on a per-activity
//!   counter is the only gate against overselling. The in-process backend is
//!   a cache-padded atomic updated with a CAS loop; the Redis backend runs
//!   the same step as a Lua script.
//!
//! - **Per-User Deduplication**: add-if-absent on a per-activity purchase
//!   set, checked before stock so a repeat attempt never consumes a unit.
//!
//! - **Compensation Instead of Transactions**: the two stores are
//!   independent; the engine orders its calls and undoes the purchase mark
//!   (and the stock unit) whenever a later step fails.
//!
//! - **Write-Ahead Order Queue**: a reservation is reported as won only after
//!   it is appended to a CRC32-checked, memory-mapped journal. The journal
//!   alone reconstructs which orders still need writing.
//!
//! - **Reconciliation Worker**: drains the queue with idempotent order
//!   creation, retries with exponential backoff, dead-letters what cannot be
//!   persisted, and repairs counters and purchase marks after a crash.
//!
//! ## Request Flow
//!
//! ```text
//! seckill(user, activity)
//!   -> oracle: open?                 no  -> NotOpen (nothing touched)
//!   -> dedup: mark user              dup -> AlreadyPurchased
//!   -> stock: take one unit          0   -> unmark, OutOfStock
//!   -> queue: durable append         err -> restore unit, unmark, retriable error
//!   -> Won { idempotency_key }
//! ```
//!
//! ## Example
//!
//! ```rust
//! use seckill_rs::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SeckillError> {
//! let manager = MemorySeckillManager::in_memory(SeckillConfig::default())?;
//! let now = current_time_millis();
//! manager.repository().insert_activity(Activity {
//!     id: ActivityId(1),
//!     product_id: ProductId(7),
//!     seckill_price: 1_999,
//!     seckill_stock: 2,
//!     start_time_ms: now + 60_000,
//!     end_time_ms: now + 3_600_000,
//!     status: ActivityStatus::Pending,
//! });
//!
//! // Preload before the window opens; at most `seckill_stock` units.
//! assert_eq!(manager.preload_stock(ActivityId(1), 2).await?, 2);
//! let outcome = manager.seckill(UserId(42), ActivityId(1)).await?;
//! assert_eq!(outcome, SeckillOutcome::NotOpen);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Enables                                        |
//! |-----------|---------|------------------------------------------------|
//! | `journal` | yes     | `FileJournal`, the memory-mapped order journal |
//! | `metrics` | no      | `metrics` counters for outcomes and the worker |
//! | `redis`   | no      | Redis-backed stock counter and purchase sets   |
//!
//! ## Status
//! This project is in active development.

pub mod seckill;

pub mod prelude;
mod utils;

#[cfg(feature = "journal")]
pub use seckill::queue::FileJournal;
pub use seckill::queue::{Journal, JournalError, JournalReadIter, JournalRecord, MemoryJournal};
#[cfg(feature = "redis")]
pub use seckill::store::{RedisDedupStore, RedisStockCounter};
pub use seckill::{
    Activity, ActivityId, ActivityRepository, ActivityStatus, ActivityWindowOracle,
    AdmissionState, ConfigError, IdempotencyKey, MemoryDedupStore, MemorySeckillManager,
    MemoryStockCounter, MemoryStore, Order, OrderQueue, OrderRepository, OrderStatus, ProductId,
    PurchaseDedupStore, QueueError, ReconciliationReport, ReconciliationWorker, RepositoryError,
    Reservation, ReservationEngine, SeckillConfig, SeckillError, SeckillManager, SeckillOutcome,
    StockCounterStore, StoreError, UserId, WorkerHandle,
};
pub use utils::current_time_millis;
