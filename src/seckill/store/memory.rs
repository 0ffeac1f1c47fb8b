//! In-process store backends built on `DashMap`.

use super::{PurchaseDedupStore, StockCounterStore};
use crate::seckill::error::StoreError;
use crate::seckill::types::{ActivityId, UserId};
use crossbeam::utils::CachePadded;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// A counter on its own cache line, so hot activities do not false-share.
type Counter = Arc<CachePadded<AtomicU64>>;

/// In-process stock counters, one atomic per activity.
///
/// The map is only touched to look up or replace the counter; decrements
/// run on the atomic itself with a compare-and-swap loop, so concurrent
/// attempts on the same activity never block each other.
#[derive(Debug, Default)]
pub struct MemoryStockCounter {
    counters: DashMap<ActivityId, Counter>,
}

impl MemoryStockCounter {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, activity_id: ActivityId) -> Option<Counter> {
        self.counters
            .get(&activity_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Decrement-if-positive on the counter, returning whether a unit was taken.
    #[inline]
    fn decrement(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }
}

impl StockCounterStore for MemoryStockCounter {
    async fn preload_stock(&self, activity_id: ActivityId, stock: u64) -> Result<(), StoreError> {
        match self.counters.entry(activity_id) {
            Entry::Occupied(entry) => entry.get().store(stock, Ordering::Release),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(CachePadded::new(AtomicU64::new(stock))));
            }
        }
        trace!(%activity_id, stock, "stock preloaded");
        Ok(())
    }

    async fn try_decrement(&self, activity_id: ActivityId) -> Result<bool, StoreError> {
        Ok(self
            .counter(activity_id)
            .is_some_and(|counter| Self::decrement(&counter)))
    }

    async fn peek_stock(&self, activity_id: ActivityId) -> Result<Option<u64>, StoreError> {
        Ok(self
            .counter(activity_id)
            .map(|counter| counter.load(Ordering::Acquire)))
    }

    async fn restore_unit(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        if let Some(counter) = self.counter(activity_id) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn clear(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        self.counters.remove(&activity_id);
        Ok(())
    }
}

/// In-process purchase sets, one `DashSet` per activity.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    purchased: DashMap<ActivityId, Arc<DashSet<UserId>>>,
}

impl MemoryDedupStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, activity_id: ActivityId) -> Option<Arc<DashSet<UserId>>> {
        self.purchased
            .get(&activity_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn set_or_create(&self, activity_id: ActivityId) -> Arc<DashSet<UserId>> {
        Arc::clone(self.purchased.entry(activity_id).or_default().value())
    }
}

impl PurchaseDedupStore for MemoryDedupStore {
    async fn try_mark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        Ok(self.set_or_create(activity_id).insert(user_id))
    }

    async fn unmark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        if let Some(set) = self.set(activity_id) {
            set.remove(&user_id);
        }
        Ok(())
    }

    async fn purchasers(&self, activity_id: ActivityId) -> Result<Vec<UserId>, StoreError> {
        let mut users: Vec<UserId> = self
            .set(activity_id)
            .map(|set| set.iter().map(|u| *u).collect())
            .unwrap_or_default();
        users.sort_unstable();
        Ok(users)
    }

    async fn purchase_count(&self, activity_id: ActivityId) -> Result<u64, StoreError> {
        Ok(self.set(activity_id).map_or(0, |set| set.len() as u64))
    }

    async fn clear(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        self.purchased.remove(&activity_id);
        Ok(())
    }
}
