//! Reservation engine: the per-request admission decision.
//!
//! A purchase attempt runs four steps in a fixed order:
//!
//! 1. Ask the [`ActivityWindowOracle`] whether the activity is open. If not,
//!    answer `NotOpen` having touched nothing.
//! 2. Mark the user in the dedup store. An existing mark answers
//!    `AlreadyPurchased`.
//! 3. Take one unit from the stock counter. If none is left, remove the
//!    mark from step 2 and answer `OutOfStock`.
//! 4. Durably enqueue the reservation and answer `Won`. The append flushes
//!    the journal, so it runs on Tokio's blocking pool.
//!
//! Steps 2 to 4 run in their own Tokio task, so a caller that times out
//! or drops the request cannot leave the chain half-applied. Any
//! infrastructure failure inside the chain undoes what was applied and
//! surfaces as a retriable [`SeckillError`]. The exception is an append
//! task that dies mid-write: its unit and mark stay held until
//! reconciliation compares them with the journal.

use super::error::SeckillError;
use super::oracle::ActivityWindowOracle;
use super::queue::OrderQueue;
use super::repository::ActivityRepository;
use super::store::{PurchaseDedupStore, StockCounterStore};
use super::types::{ActivityId, AdmissionState, Reservation, SeckillOutcome, UserId};
use crate::utils::current_time_millis;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
fn record_outcome(result: &Result<SeckillOutcome, SeckillError>) {
    let outcome = match result {
        Ok(outcome) => outcome.as_str(),
        Err(_) => "error",
    };
    metrics::counter!("seckill_attempts_total", "outcome" => outcome).increment(1);
}

/// The stores and queue touched by the mutating part of an attempt.
struct AdmissionChain<S, D> {
    stock: Arc<S>,
    dedup: Arc<D>,
    queue: Arc<OrderQueue>,
}

impl<S, D> Clone for AdmissionChain<S, D> {
    fn clone(&self) -> Self {
        Self {
            stock: Arc::clone(&self.stock),
            dedup: Arc::clone(&self.dedup),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<S: StockCounterStore, D: PurchaseDedupStore> AdmissionChain<S, D> {
    async fn unmark(&self, activity_id: ActivityId, user_id: UserId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("seckill_rollbacks_total", "store" => "dedup").increment(1);
        if let Err(e) = self.dedup.unmark_purchased(activity_id, user_id).await {
            // Left for reconciliation, which drops marks without a reservation.
            warn!(%activity_id, %user_id, error = %e, "failed to roll back purchase mark");
        }
    }

    async fn release(&self, activity_id: ActivityId, user_id: UserId) {
        #[cfg(feature = "metrics")]
        metrics::counter!("seckill_rollbacks_total", "store" => "stock").increment(1);
        if let Err(e) = self.stock.restore_unit(activity_id).await {
            warn!(%activity_id, error = %e, "failed to restore stock unit");
        }
        self.unmark(activity_id, user_id).await;
    }

    async fn run(
        self,
        user_id: UserId,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<SeckillOutcome, SeckillError> {
        if !self.dedup.try_mark_purchased(activity_id, user_id).await? {
            return Ok(SeckillOutcome::AlreadyPurchased);
        }

        let taken = match self.stock.try_decrement(activity_id).await {
            Ok(taken) => taken,
            Err(e) => {
                self.unmark(activity_id, user_id).await;
                return Err(e.into());
            }
        };
        if !taken {
            self.unmark(activity_id, user_id).await;
            return Ok(SeckillOutcome::OutOfStock);
        }

        let reservation = Reservation::new(user_id, activity_id, now_ms);
        // The durable append flushes to disk, so it runs on the blocking pool.
        let queue = Arc::clone(&self.queue);
        let record = reservation.clone();
        match tokio::task::spawn_blocking(move || queue.enqueue(&record)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(%activity_id, %user_id, error = %e, "enqueue failed; rolling back reservation");
                self.release(activity_id, user_id).await;
                return Err(e.into());
            }
            Err(e) => {
                // Whether the append landed is unknown. Reconciliation settles
                // the unit and the mark against the journal.
                error!(%activity_id, %user_id, error = %e, "enqueue task failed; reservation left for reconciliation");
                return Err(SeckillError::Internal {
                    message: format!("enqueue task failed: {e}"),
                });
            }
        }

        Ok(SeckillOutcome::Won {
            idempotency_key: reservation.idempotency_key,
        })
    }
}

/// Composes the oracle, the two fast-cache stores and the order queue into
/// the admission decision.
///
/// Cloning the engine is cheap; every clone shares the same stores.
pub struct ReservationEngine<S, D, A> {
    oracle: Arc<ActivityWindowOracle<A>>,
    chain: AdmissionChain<S, D>,
}

impl<S, D, A> Clone for ReservationEngine<S, D, A> {
    fn clone(&self) -> Self {
        Self {
            oracle: Arc::clone(&self.oracle),
            chain: self.chain.clone(),
        }
    }
}

impl<S, D, A> ReservationEngine<S, D, A>
where
    S: StockCounterStore,
    D: PurchaseDedupStore,
    A: ActivityRepository,
{
    /// Create an engine over shared components.
    #[must_use]
    pub fn new(
        oracle: Arc<ActivityWindowOracle<A>>,
        stock: Arc<S>,
        dedup: Arc<D>,
        queue: Arc<OrderQueue>,
    ) -> Self {
        Self {
            oracle,
            chain: AdmissionChain {
                stock,
                dedup,
                queue,
            },
        }
    }

    /// Attempt to reserve one unit of `activity_id` for `user_id`.
    ///
    /// Returns `Won` only once the reservation is durably enqueued.
    /// Business rejections are `Ok` outcomes.
    ///
    /// # Errors
    ///
    /// Returns a retriable [`SeckillError`] if a store, the repository or
    /// the queue fails. Whatever the attempt applied has been rolled back,
    /// so the same call may be repeated.
    pub async fn seckill(
        &self,
        user_id: UserId,
        activity_id: ActivityId,
    ) -> Result<SeckillOutcome, SeckillError> {
        self.seckill_at(user_id, activity_id, current_time_millis())
            .await
    }

    /// [`seckill`](Self::seckill) evaluated at `now_ms`.
    ///
    /// # Errors
    ///
    /// See [`seckill`](Self::seckill).
    pub async fn seckill_at(
        &self,
        user_id: UserId,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<SeckillOutcome, SeckillError> {
        let result = self.admit(user_id, activity_id, now_ms).await;
        match &result {
            Ok(SeckillOutcome::Won { idempotency_key }) => {
                debug!(%activity_id, %user_id, key = %idempotency_key, "reservation won");
            }
            Ok(outcome) => debug!(%activity_id, %user_id, %outcome, "attempt rejected"),
            Err(e) => warn!(%activity_id, %user_id, error = %e, "attempt failed"),
        }
        #[cfg(feature = "metrics")]
        record_outcome(&result);
        result
    }

    async fn admit(
        &self,
        user_id: UserId,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<SeckillOutcome, SeckillError> {
        let state = self.oracle.admission_state_at(activity_id, now_ms).await?;
        if !state.is_open() {
            return Ok(SeckillOutcome::NotOpen);
        }

        let chain = self.chain.clone();
        tokio::spawn(chain.run(user_id, activity_id, now_ms))
            .await
            .map_err(|e| SeckillError::Internal {
                message: format!("admission task failed: {e}"),
            })?
    }

    /// Load `stock` units into the counter of an activity.
    ///
    /// `stock` may be smaller than the activity's `seckill_stock`, for a
    /// partial allotment, but never larger. Safe to repeat before the
    /// activity opens; each call overwrites the counter. Returns the stock
    /// loaded.
    ///
    /// # Errors
    ///
    /// - [`SeckillError::ActivityNotFound`] for an unknown activity.
    /// - [`SeckillError::PreloadWhileOpen`] once the activity is admitting.
    /// - [`SeckillError::StockExceedsActivity`] if `stock` is above
    ///   `seckill_stock`.
    /// - [`SeckillError::Store`] / [`SeckillError::Repository`] on
    ///   infrastructure failure.
    pub async fn preload_stock(
        &self,
        activity_id: ActivityId,
        stock: u64,
    ) -> Result<u64, SeckillError> {
        self.preload_stock_at(activity_id, stock, current_time_millis())
            .await
    }

    /// [`preload_stock`](Self::preload_stock) evaluated at `now_ms`.
    ///
    /// # Errors
    ///
    /// See [`preload_stock`](Self::preload_stock).
    pub async fn preload_stock_at(
        &self,
        activity_id: ActivityId,
        stock: u64,
        now_ms: u64,
    ) -> Result<u64, SeckillError> {
        // Bypass the cache: the open check must see the current status.
        self.oracle.invalidate(activity_id);
        let activity = self
            .oracle
            .activity_at(activity_id, now_ms)
            .await?
            .ok_or(SeckillError::ActivityNotFound { activity_id })?;

        let state = activity.admission_state_at(now_ms);
        if state == AdmissionState::Open {
            warn!(%activity_id, "refusing to preload stock of an open activity");
            return Err(SeckillError::PreloadWhileOpen { activity_id, state });
        }
        if stock > activity.seckill_stock {
            return Err(SeckillError::StockExceedsActivity {
                activity_id,
                requested: stock,
                seckill_stock: activity.seckill_stock,
            });
        }

        self.chain.stock.preload_stock(activity_id, stock).await?;
        info!(%activity_id, stock, seckill_stock = activity.seckill_stock, "stock preloaded");
        Ok(stock)
    }

    /// Clear the stock counter and purchase marks of an activity between
    /// sales.
    ///
    /// # Errors
    ///
    /// - [`SeckillError::PreloadWhileOpen`] while the activity is admitting.
    /// - [`SeckillError::Store`] / [`SeckillError::Repository`] on
    ///   infrastructure failure.
    pub async fn reset_activity(&self, activity_id: ActivityId) -> Result<(), SeckillError> {
        self.reset_activity_at(activity_id, current_time_millis())
            .await
    }

    /// [`reset_activity`](Self::reset_activity) evaluated at `now_ms`.
    ///
    /// # Errors
    ///
    /// See [`reset_activity`](Self::reset_activity).
    pub async fn reset_activity_at(
        &self,
        activity_id: ActivityId,
        now_ms: u64,
    ) -> Result<(), SeckillError> {
        self.oracle.invalidate(activity_id);
        let state = self.oracle.admission_state_at(activity_id, now_ms).await?;
        if state == AdmissionState::Open {
            return Err(SeckillError::PreloadWhileOpen { activity_id, state });
        }

        self.chain.stock.clear(activity_id).await?;
        self.chain.dedup.clear(activity_id).await?;
        info!(%activity_id, "activity cache entries cleared");
        Ok(())
    }

    /// Remaining stock for diagnostics. Never gate a decision on it.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::Store`] if the counter cannot be read.
    pub async fn peek_stock(&self, activity_id: ActivityId) -> Result<Option<u64>, SeckillError> {
        Ok(self.chain.stock.peek_stock(activity_id).await?)
    }

    /// The oracle this engine consults.
    #[must_use]
    pub fn oracle(&self) -> &Arc<ActivityWindowOracle<A>> {
        &self.oracle
    }
}

impl<S, D, A> std::fmt::Debug for ReservationEngine<S, D, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationEngine")
            .field("queue", &self.chain.queue)
            .finish_non_exhaustive()
    }
}
