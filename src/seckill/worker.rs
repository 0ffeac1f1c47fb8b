//! Reconciliation worker: turns queued reservations into orders and
//! repairs fast-cache state after a crash.
//!
//! Order creation is idempotent on the reservation's key, so the
//! at-least-once delivery of the queue never yields duplicate orders:
//!
//! - a confirmed order for the key means the delivery is a duplicate and
//!   is acknowledged again;
//! - an unconfirmed order means a previous attempt stopped half-way and is
//!   resumed from confirmation;
//! - otherwise the order is inserted and confirmed.
//!
//! Transient repository failures are retried with exponential backoff
//! (`worker_base_backoff_ms * 2^attempt`). After `worker_max_attempts` the
//! reservation is dead-lettered in the journal instead of being dropped.

use super::config::SeckillConfig;
use super::error::{QueueError, RepositoryError, SeckillError};
use super::oracle::ActivityWindowOracle;
use super::queue::{Delivery, OrderQueue, QueueConsumer};
use super::repository::{ActivityRepository, OrderRepository};
use super::store::{PurchaseDedupStore, StockCounterStore};
use super::types::{ActivityId, Order, OrderStatus, Reservation, UserId};
use crate::utils::current_time_millis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// An order was created or completed and the reservation acknowledged.
    Persisted,
    /// The order already existed in its final state.
    Duplicate,
    /// The reservation was moved to the dead-letter record.
    DeadLettered,
}

/// Why a persistence attempt failed.
enum Failure {
    /// Worth retrying.
    Transient(RepositoryError),
    /// Retrying cannot help.
    Permanent(String),
}

impl From<RepositoryError> for Failure {
    fn from(err: RepositoryError) -> Self {
        Failure::Transient(err)
    }
}

impl Failure {
    fn reason(&self) -> String {
        match self {
            Failure::Transient(e) => e.to_string(),
            Failure::Permanent(reason) => reason.clone(),
        }
    }
}

/// Result of [`ReconciliationWorker::reconcile_activity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// The activity reconciled.
    pub activity_id: ActivityId,
    /// Orders found in the persistent store.
    pub persisted_orders: u64,
    /// Reservations in the journal still waiting for their order.
    pub pending_reservations: u64,
    /// Dead-lettered reservations that never produced an order.
    pub dead_lettered: u64,
    /// Distinct users holding a unit: the union of the three sets above.
    pub admitted: u64,
    /// Stock counter before reconciliation (`None` if it was missing).
    pub counter_before: Option<u64>,
    /// Stock counter after reconciliation.
    pub counter_after: u64,
    /// Admitted users whose purchase mark had to be restored.
    pub remarked: u64,
    /// Purchase marks removed because no reservation backs them.
    pub stale_marks_removed: u64,
    /// Pending reservations pushed back to the worker.
    pub redelivered: u64,
}

impl ReconciliationReport {
    /// Returns `true` if the counter or the purchase marks were repaired.
    #[must_use]
    pub fn drift_detected(&self) -> bool {
        self.counter_before != Some(self.counter_after)
            || self.remarked > 0
            || self.stale_marks_removed > 0
    }
}

/// Handle to a worker running on the Tokio runtime.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker after it drains the deliveries already queued, and
    /// wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "reconciliation worker task failed");
        }
    }

    /// Returns `true` once the worker loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// The single logical consumer of the order queue.
pub struct ReconciliationWorker<S, D, A, O> {
    queue: Arc<OrderQueue>,
    orders: Arc<O>,
    oracle: Arc<ActivityWindowOracle<A>>,
    stock: Arc<S>,
    dedup: Arc<D>,
    config: SeckillConfig,
    persisted_count: AtomicU64,
    duplicate_count: AtomicU64,
    dead_letter_count: AtomicU64,
}

impl<S, D, A, O> ReconciliationWorker<S, D, A, O>
where
    S: StockCounterStore,
    D: PurchaseDedupStore,
    A: ActivityRepository,
    O: OrderRepository,
{
    /// Create a worker over shared components.
    #[must_use]
    pub fn new(
        queue: Arc<OrderQueue>,
        orders: Arc<O>,
        oracle: Arc<ActivityWindowOracle<A>>,
        stock: Arc<S>,
        dedup: Arc<D>,
        config: SeckillConfig,
    ) -> Self {
        Self {
            queue,
            orders,
            oracle,
            stock,
            dedup,
            config,
            persisted_count: AtomicU64::new(0),
            duplicate_count: AtomicU64::new(0),
            dead_letter_count: AtomicU64::new(0),
        }
    }

    /// Orders persisted by this worker.
    #[must_use]
    pub fn persisted_count(&self) -> u64 {
        self.persisted_count.load(Ordering::Relaxed)
    }

    /// Duplicate deliveries acknowledged without writing.
    #[must_use]
    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count.load(Ordering::Relaxed)
    }

    /// Reservations dead-lettered by this worker.
    #[must_use]
    pub fn dead_letter_count(&self) -> u64 {
        self.dead_letter_count.load(Ordering::Relaxed)
    }

    /// Spawn [`run`](Self::run) on the current Tokio runtime.
    pub fn spawn(self: Arc<Self>, consumer: QueueConsumer) -> WorkerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(consumer, shutdown_rx).await });
        WorkerHandle { shutdown, task }
    }

    /// Drain the queue until `shutdown` flips to `true` (or its sender is
    /// dropped) or the queue closes. Deliveries already buffered when the
    /// shutdown arrives are processed before returning.
    pub async fn run(&self, mut consumer: QueueConsumer, mut shutdown: watch::Receiver<bool>) {
        info!("reconciliation worker started");
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => self.handle(&delivery).await,
                    None => break,
                },
            }
        }

        while let Some(delivery) = consumer.try_recv() {
            self.handle(&delivery).await;
        }
        info!(
            persisted = self.persisted_count(),
            duplicates = self.duplicate_count(),
            dead_lettered = self.dead_letter_count(),
            "reconciliation worker stopped"
        );
    }

    async fn handle(&self, delivery: &Delivery) {
        if let Err(e) = self.process(delivery).await {
            // The journal still holds the reservation as pending; recovery
            // redelivers it.
            error!(sequence = delivery.sequence, error = %e, "failed to record delivery outcome");
        }
    }

    /// Persist the order for one delivery, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the acknowledgement or dead-letter record
    /// cannot be journaled. The reservation then stays pending.
    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessOutcome, QueueError> {
        let reservation = &delivery.reservation;
        let max_attempts = self.config.worker_max_attempts.max(1);

        for attempt in 0..max_attempts {
            let failure = match self.persist(reservation).await {
                Ok(outcome) => {
                    self.queue.acknowledge(&reservation.idempotency_key)?;
                    match outcome {
                        ProcessOutcome::Duplicate => {
                            self.duplicate_count.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {
                            self.persisted_count.fetch_add(1, Ordering::Relaxed);
                            #[cfg(feature = "metrics")]
                            metrics::counter!("seckill_orders_persisted_total").increment(1);
                        }
                    }
                    return Ok(outcome);
                }
                Err(failure) => failure,
            };

            if let Failure::Permanent(_) = failure {
                return self.give_up(reservation, &failure, attempt + 1).await;
            }
            warn!(
                attempt = attempt + 1,
                max = max_attempts,
                key = %reservation.idempotency_key,
                error = %failure.reason(),
                "order persistence failed, retrying"
            );
            if attempt + 1 >= max_attempts {
                return self.give_up(reservation, &failure, attempt + 1).await;
            }
            tokio::time::sleep(Duration::from_millis(self.config.backoff_ms(attempt))).await;
        }

        // `max_attempts >= 1`, so the loop always returns.
        Ok(ProcessOutcome::DeadLettered)
    }

    async fn persist(&self, reservation: &Reservation) -> Result<ProcessOutcome, Failure> {
        let key = &reservation.idempotency_key;
        match self.orders.find_order(key).await? {
            Some(order) if order.status == OrderStatus::Confirmed => {
                debug!(%key, "duplicate delivery");
                Ok(ProcessOutcome::Duplicate)
            }
            Some(_) => {
                self.orders.confirm_order(key).await?;
                Ok(ProcessOutcome::Persisted)
            }
            None => {
                let activity = self
                    .oracle
                    .activity(reservation.activity_id)
                    .await?
                    .ok_or_else(|| {
                        Failure::Permanent(format!(
                            "activity {} not found",
                            reservation.activity_id
                        ))
                    })?;
                let order = Order::from_reservation(reservation, &activity, current_time_millis());
                self.orders.insert_order(&order).await?;
                self.orders.confirm_order(key).await?;
                debug!(%key, order_no = %order.order_no, "order persisted");
                Ok(ProcessOutcome::Persisted)
            }
        }
    }

    async fn give_up(
        &self,
        reservation: &Reservation,
        failure: &Failure,
        attempts: u32,
    ) -> Result<ProcessOutcome, QueueError> {
        let reason = failure.reason();
        self.queue.dead_letter(reservation, &reason, attempts)?;
        self.dead_letter_count.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!("seckill_dead_letters_total").increment(1);

        if let Err(e) = self.orders.mark_failed(&reservation.idempotency_key).await {
            warn!(key = %reservation.idempotency_key, error = %e, "could not mark order failed");
        }
        error!(
            key = %reservation.idempotency_key,
            attempts,
            %reason,
            "reservation dead-lettered"
        );
        Ok(ProcessOutcome::DeadLettered)
    }

    /// Repair the fast-cache state of one activity from the durable record.
    ///
    /// Every user holding an order, a pending reservation or a dead-letter
    /// record holds one unit. The stock counter is reset to
    /// `seckill_stock - admitted` if it drifted or was lost, missing
    /// purchase marks are restored, marks without a reservation behind them
    /// (requests interrupted before enqueue) are removed, and pending
    /// reservations are redelivered.
    ///
    /// Run it before the activity resumes admitting: an attempt in flight
    /// between its stock decrement and its enqueue would be counted as
    /// drift.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::ActivityNotFound`] for an unknown activity,
    /// or the store, repository or queue failure that stopped it.
    pub async fn reconcile_activity(
        &self,
        activity_id: ActivityId,
    ) -> Result<ReconciliationReport, SeckillError> {
        self.oracle.invalidate(activity_id);
        let activity = self
            .oracle
            .activity(activity_id)
            .await?
            .ok_or(SeckillError::ActivityNotFound { activity_id })?;

        let mut admitted: BTreeSet<UserId> =
            self.orders.order_users(activity_id).await?.into_iter().collect();
        let persisted_orders = admitted.len() as u64;

        let pending = self.queue.pending_for(activity_id)?;
        let pending_reservations = pending.len() as u64;
        admitted.extend(pending.iter().map(|d| d.reservation.user_id));

        let before_dead = admitted.len();
        admitted.extend(
            self.queue
                .dead_letters()?
                .into_iter()
                .filter(|d| d.reservation.activity_id == activity_id)
                .map(|d| d.reservation.user_id),
        );
        let dead_lettered = (admitted.len() - before_dead) as u64;

        let admitted_count = admitted.len() as u64;
        let counter_after = activity.seckill_stock.saturating_sub(admitted_count);
        let counter_before = self.stock.peek_stock(activity_id).await?;
        if counter_before != Some(counter_after) {
            warn!(
                %activity_id,
                ?counter_before,
                counter_after,
                admitted = admitted_count,
                "stock counter drift corrected"
            );
            self.stock.preload_stock(activity_id, counter_after).await?;
        }

        let marked: BTreeSet<UserId> =
            self.dedup.purchasers(activity_id).await?.into_iter().collect();
        let mut remarked = 0u64;
        for user_id in admitted.difference(&marked) {
            if self.dedup.try_mark_purchased(activity_id, *user_id).await? {
                remarked = remarked.saturating_add(1);
            }
        }
        let mut stale_marks_removed = 0u64;
        for user_id in marked.difference(&admitted) {
            self.dedup.unmark_purchased(activity_id, *user_id).await?;
            stale_marks_removed = stale_marks_removed.saturating_add(1);
        }

        let redelivered = self.queue.redeliver(pending) as u64;

        let report = ReconciliationReport {
            activity_id,
            persisted_orders,
            pending_reservations,
            dead_lettered,
            admitted: admitted_count,
            counter_before,
            counter_after,
            remarked,
            stale_marks_removed,
            redelivered,
        };
        info!(
            %activity_id,
            admitted = report.admitted,
            redelivered = report.redelivered,
            drift = report.drift_detected(),
            "activity reconciled"
        );
        Ok(report)
    }
}

impl<S, D, A, O> std::fmt::Debug for ReconciliationWorker<S, D, A, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationWorker")
            .field("persisted_count", &self.persisted_count.load(Ordering::Relaxed))
            .field("duplicate_count", &self.duplicate_count.load(Ordering::Relaxed))
            .field("dead_letter_count", &self.dead_letter_count.load(Ordering::Relaxed))
            .field("max_attempts", &self.config.worker_max_attempts)
            .finish()
    }
}
