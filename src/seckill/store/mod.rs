//! Shared fast-cache tier: per-activity stock counters and purchase sets.
//!
//! Each store exposes one atomic primitive on the hot path
//! ([`StockCounterStore::try_decrement`] and
//! [`PurchaseDedupStore::try_mark_purchased`]). The two stores are
//! independent; the reservation engine orders the calls and compensates on
//! failure instead of wrapping them in a cross-store transaction.
//!
//! # Backends
//!
//! - [`MemoryStockCounter`] / [`MemoryDedupStore`]: in-process, lock-free
//!   per key. Atomic only within one process.
//! - `RedisStockCounter` / `RedisDedupStore`: system-wide atomicity via
//!   Redis (requires the `redis` feature).

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{MemoryDedupStore, MemoryStockCounter};
#[cfg(feature = "redis")]
pub use self::redis::{RedisDedupStore, RedisStockCounter, dedup_key, stock_key};

use super::error::StoreError;
use super::types::{ActivityId, UserId};
use std::future::Future;

/// Per-activity remaining-stock counter.
///
/// Implementations must make [`try_decrement`](Self::try_decrement) a single
/// atomic step for every caller that shares the store: it is the only
/// mechanism that prevents overselling.
pub trait StockCounterStore: Send + Sync + 'static {
    /// Set the counter unconditionally. Calling it twice with the same value
    /// has the same effect as calling it once.
    fn preload_stock(
        &self,
        activity_id: ActivityId,
        stock: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically decrement by one if the counter is positive.
    ///
    /// Returns `false`, leaving the value at zero, when no stock remains or
    /// the counter was never preloaded.
    fn try_decrement(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Current value for diagnostics and reconciliation. `None` if the
    /// counter was never preloaded (or has been cleared).
    ///
    /// Never gate an admission decision on this value.
    fn peek_stock(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<Option<u64>, StoreError>> + Send;

    /// Give back one unit taken by [`try_decrement`](Self::try_decrement).
    ///
    /// Compensation only. Does nothing if the counter does not exist.
    fn restore_unit(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove the counter.
    fn clear(&self, activity_id: ActivityId) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Per-activity set of users holding a reservation.
pub trait PurchaseDedupStore: Send + Sync + 'static {
    /// Atomically insert `(activity, user)` if absent.
    ///
    /// Returns `true` if the entry was inserted, `false` if it already
    /// existed.
    fn try_mark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Remove an entry. Compensation and reconciliation only.
    fn unmark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Every user currently marked for the activity.
    fn purchasers(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<Vec<UserId>, StoreError>> + Send;

    /// Number of users currently marked for the activity.
    fn purchase_count(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Remove every entry for the activity.
    fn clear(&self, activity_id: ActivityId) -> impl Future<Output = Result<(), StoreError>> + Send;
}
