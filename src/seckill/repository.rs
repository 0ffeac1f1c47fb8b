//! Persistent store contracts and the in-process implementation.
//!
//! The engine only reads activities (through the oracle); orders are
//! written only by the reconciliation worker, one idempotency key at a
//! time, so upsert-by-key is the strongest isolation required.

use super::error::RepositoryError;
use super::types::{Activity, ActivityId, ActivityStatus, IdempotencyKey, Order, OrderStatus, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use tracing::{debug, info};

/// Read access to activity metadata.
pub trait ActivityRepository: Send + Sync + 'static {
    /// Load an activity. `Ok(None)` if it does not exist.
    fn get_activity(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<Option<Activity>, RepositoryError>> + Send;
}

/// The persistent order table, keyed by idempotency key.
pub trait OrderRepository: Send + Sync + 'static {
    /// Look up the order created for a reservation.
    fn find_order(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<Option<Order>, RepositoryError>> + Send;

    /// Insert the order unless one with the same key exists.
    ///
    /// Returns `true` if inserted, `false` if an order was already present.
    fn insert_order(&self, order: &Order)
    -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark the order `Confirmed` and decrement the activity's audit stock,
    /// as one step.
    ///
    /// Returns `false` if the order was already confirmed; the audit stock
    /// is left untouched in that case.
    fn confirm_order(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Mark an unconfirmed order `Failed`. Does nothing if no order exists.
    fn mark_failed(
        &self,
        key: &IdempotencyKey,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Number of orders recorded for the activity, in any status.
    fn count_orders(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<u64, RepositoryError>> + Send;

    /// Users holding an order for the activity, in any status.
    fn order_users(
        &self,
        activity_id: ActivityId,
    ) -> impl Future<Output = Result<Vec<UserId>, RepositoryError>> + Send;
}

/// An in-process persistent store.
///
/// Holds activities, orders and per-activity audit stock in `DashMap`s.
/// Besides the two repository traits it carries the administrative
/// operations (activity creation and the start/end status sweep) that a
/// real deployment runs elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    activities: DashMap<ActivityId, Activity>,
    audit_stock: DashMap<ActivityId, u64>,
    orders: DashMap<IdempotencyKey, Order>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an activity. The audit stock restarts at
    /// `seckill_stock`.
    pub fn insert_activity(&self, activity: Activity) {
        debug!(activity_id = %activity.id, stock = activity.seckill_stock, "activity stored");
        self.audit_stock.insert(activity.id, activity.seckill_stock);
        self.activities.insert(activity.id, activity);
    }

    /// Set an activity's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::ActivityNotFound`] for an unknown activity.
    pub fn set_status(
        &self,
        activity_id: ActivityId,
        status: ActivityStatus,
    ) -> Result<(), RepositoryError> {
        let mut activity = self
            .activities
            .get_mut(&activity_id)
            .ok_or(RepositoryError::ActivityNotFound { activity_id })?;
        activity.status = status;
        Ok(())
    }

    /// Advance lifecycle statuses by the clock: `Pending` becomes `Active`
    /// once `start_time` has passed, `Active` becomes `Closed` once
    /// `end_time` has passed.
    ///
    /// Returns the activities whose status changed, with their new status.
    pub fn sweep_statuses(&self, now_ms: u64) -> Vec<(ActivityId, ActivityStatus)> {
        let mut changed = Vec::new();
        for mut activity in self.activities.iter_mut() {
            let next = match activity.status {
                ActivityStatus::Pending if now_ms >= activity.start_time_ms => {
                    ActivityStatus::Active
                }
                ActivityStatus::Active if now_ms >= activity.end_time_ms => ActivityStatus::Closed,
                _ => continue,
            };
            activity.status = next;
            changed.push((activity.id, next));
        }
        changed.sort_unstable_by_key(|(id, _)| *id);
        if !changed.is_empty() {
            info!(count = changed.len(), "activity statuses advanced");
        }
        changed
    }

    /// Remaining audit stock: `seckill_stock` minus confirmed orders.
    #[must_use]
    pub fn audit_stock(&self, activity_id: ActivityId) -> Option<u64> {
        self.audit_stock.get(&activity_id).map(|stock| *stock)
    }

    /// Every order of the activity, oldest first.
    #[must_use]
    pub fn orders_for(&self, activity_id: ActivityId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|o| o.activity_id == activity_id)
            .map(|o| o.value().clone())
            .collect();
        orders.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        orders
    }
}

impl ActivityRepository for MemoryStore {
    async fn get_activity(&self, activity_id: ActivityId) -> Result<Option<Activity>, RepositoryError> {
        Ok(self.activities.get(&activity_id).map(|a| a.value().clone()))
    }
}

impl OrderRepository for MemoryStore {
    async fn find_order(&self, key: &IdempotencyKey) -> Result<Option<Order>, RepositoryError> {
        Ok(self.orders.get(key).map(|o| o.value().clone()))
    }

    async fn insert_order(&self, order: &Order) -> Result<bool, RepositoryError> {
        match self.orders.entry(order.idempotency_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(order.clone());
                Ok(true)
            }
        }
    }

    async fn confirm_order(&self, key: &IdempotencyKey) -> Result<bool, RepositoryError> {
        let mut order = self
            .orders
            .get_mut(key)
            .ok_or_else(|| RepositoryError::OrderNotFound {
                key: key.to_string(),
            })?;
        if order.status == OrderStatus::Confirmed {
            return Ok(false);
        }
        // The order's shard lock is held across both writes.
        if let Some(mut stock) = self.audit_stock.get_mut(&order.activity_id) {
            *stock = stock.saturating_sub(1);
        }
        order.status = OrderStatus::Confirmed;
        Ok(true)
    }

    async fn mark_failed(&self, key: &IdempotencyKey) -> Result<(), RepositoryError> {
        if let Some(mut order) = self.orders.get_mut(key)
            && order.status != OrderStatus::Confirmed
        {
            order.status = OrderStatus::Failed;
        }
        Ok(())
    }

    async fn count_orders(&self, activity_id: ActivityId) -> Result<u64, RepositoryError> {
        Ok(self
            .orders
            .iter()
            .filter(|o| o.activity_id == activity_id)
            .count() as u64)
    }

    async fn order_users(&self, activity_id: ActivityId) -> Result<Vec<UserId>, RepositoryError> {
        let mut users: Vec<UserId> = self
            .orders
            .iter()
            .filter(|o| o.activity_id == activity_id)
            .map(|o| o.user_id)
            .collect();
        users.sort_unstable();
        Ok(users)
    }
}
