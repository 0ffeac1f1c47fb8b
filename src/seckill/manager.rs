/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Composition root wiring the engine, the queue and the worker together.
//!
//! [`SeckillManager`] owns one of each component and shares them between
//! the request path ([`ReservationEngine`]) and the background path
//! ([`ReconciliationWorker`]). The queue consumer is handed out once, when
//! the worker starts.

use super::config::SeckillConfig;
use super::engine::ReservationEngine;
use super::error::SeckillError;
use super::oracle::ActivityWindowOracle;
use super::queue::OrderQueue;
use super::repository::{ActivityRepository, MemoryStore, OrderRepository};
use super::store::{MemoryDedupStore, MemoryStockCounter, PurchaseDedupStore, StockCounterStore};
use super::types::{ActivityId, ActivityStatus, SeckillOutcome, UserId};
use super::worker::{ReconciliationReport, ReconciliationWorker, WorkerHandle};
use std::sync::Arc;
use tracing::{info, warn};

/// The all-in-memory stack.
pub type MemorySeckillManager = SeckillManager<MemoryStockCounter, MemoryDedupStore, MemoryStore>;

/// Owns and wires every seckill component.
///
/// `R` is the persistent store; it serves both activity reads and order
/// writes.
pub struct SeckillManager<S, D, R> {
    config: SeckillConfig,
    repository: Arc<R>,
    queue: Arc<OrderQueue>,
    engine: ReservationEngine<S, D, R>,
    worker: Arc<ReconciliationWorker<S, D, R, R>>,
}

fn open_queue(config: &SeckillConfig) -> Result<OrderQueue, SeckillError> {
    match &config.journal_dir {
        #[cfg(feature = "journal")]
        Some(dir) => {
            info!(dir = %dir.display(), "opening order queue journal");
            Ok(OrderQueue::open_file(dir, config.journal_segment_size)?)
        }
        #[cfg(not(feature = "journal"))]
        Some(_) => Err(super::error::ConfigError::Invalid {
            field: "journal_dir",
            message: "a file journal requires the `journal` feature".to_string(),
        }
        .into()),
        None => {
            warn!("order queue journal kept in memory; reservations do not survive a restart");
            Ok(OrderQueue::in_memory())
        }
    }
}

impl<S, D, R> SeckillManager<S, D, R>
where
    S: StockCounterStore,
    D: PurchaseDedupStore,
    R: ActivityRepository + OrderRepository,
{
    /// Build a manager over the given stores.
    ///
    /// The order queue is journaled under `config.journal_dir`, or kept in
    /// memory when it is unset.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::Config`] for an invalid configuration and
    /// [`SeckillError::Queue`] if the journal cannot be opened.
    pub fn new(
        config: SeckillConfig,
        stock: Arc<S>,
        dedup: Arc<D>,
        repository: Arc<R>,
    ) -> Result<Self, SeckillError> {
        config.validate()?;
        let queue = Arc::new(open_queue(&config)?);
        let oracle = Arc::new(ActivityWindowOracle::new(
            Arc::clone(&repository),
            config.activity_cache_ttl_ms,
        ));

        let engine = ReservationEngine::new(
            Arc::clone(&oracle),
            Arc::clone(&stock),
            Arc::clone(&dedup),
            Arc::clone(&queue),
        );
        let worker = Arc::new(ReconciliationWorker::new(
            Arc::clone(&queue),
            Arc::clone(&repository),
            oracle,
            stock,
            dedup,
            config.clone(),
        ));

        Ok(Self {
            config,
            repository,
            queue,
            engine,
            worker,
        })
    }

    /// Attempt to reserve one unit. See [`ReservationEngine::seckill`].
    ///
    /// # Errors
    ///
    /// Returns a retriable [`SeckillError`] on infrastructure failure.
    pub async fn seckill(
        &self,
        user_id: UserId,
        activity_id: ActivityId,
    ) -> Result<SeckillOutcome, SeckillError> {
        self.engine.seckill(user_id, activity_id).await
    }

    /// Load `stock` units into the counter of an activity ahead of its
    /// start.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::preload_stock`].
    pub async fn preload_stock(
        &self,
        activity_id: ActivityId,
        stock: u64,
    ) -> Result<u64, SeckillError> {
        self.engine.preload_stock(activity_id, stock).await
    }

    /// Clear the stock counter and purchase marks of a finished activity.
    ///
    /// # Errors
    ///
    /// See [`ReservationEngine::reset_activity`].
    pub async fn reset_activity(&self, activity_id: ActivityId) -> Result<(), SeckillError> {
        self.engine.reset_activity(activity_id).await
    }

    /// Start the reconciliation worker on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SeckillError::Queue`] if a worker was already started.
    pub fn start_worker(&self) -> Result<WorkerHandle, SeckillError> {
        let consumer = self.queue.take_consumer()?;
        info!("starting reconciliation worker");
        Ok(Arc::clone(&self.worker).spawn(consumer))
    }

    /// Reconcile each activity in turn, then compact the order queue
    /// journal. Run it at startup, before admission resumes.
    ///
    /// # Errors
    ///
    /// Stops at the first activity that fails to reconcile. A failed
    /// compaction is reported after every activity has been reconciled.
    pub async fn recover(
        &self,
        activity_ids: &[ActivityId],
    ) -> Result<Vec<ReconciliationReport>, SeckillError> {
        if let Err(e) = self.queue.verify_integrity() {
            warn!(error = %e, "order queue journal has unreadable records");
        }

        let mut reports = Vec::with_capacity(activity_ids.len());
        for &activity_id in activity_ids {
            reports.push(self.worker.reconcile_activity(activity_id).await?);
        }
        let drifted = reports.iter().filter(|r| r.drift_detected()).count();
        let discarded = self.queue.compact()?;
        info!(activities = reports.len(), drifted, discarded, "recovery complete");
        Ok(reports)
    }

    /// The reservation engine.
    #[must_use]
    pub fn engine(&self) -> &ReservationEngine<S, D, R> {
        &self.engine
    }

    /// The reconciliation worker.
    #[must_use]
    pub fn worker(&self) -> &Arc<ReconciliationWorker<S, D, R, R>> {
        &self.worker
    }

    /// The order queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OrderQueue> {
        &self.queue
    }

    /// The persistent store.
    #[must_use]
    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &SeckillConfig {
        &self.config
    }
}

impl MemorySeckillManager {
    /// Build the all-in-memory stack.
    ///
    /// # Errors
    ///
    /// See [`SeckillManager::new`].
    pub fn in_memory(config: SeckillConfig) -> Result<Self, SeckillError> {
        Self::new(
            config,
            Arc::new(MemoryStockCounter::new()),
            Arc::new(MemoryDedupStore::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    /// Run the start/end status sweep and drop changed activities from the
    /// oracle cache so admission sees the new status immediately.
    pub fn advance_statuses(&self, now_ms: u64) -> Vec<(ActivityId, ActivityStatus)> {
        let changed = self.repository.sweep_statuses(now_ms);
        for (activity_id, status) in &changed {
            self.engine.oracle().invalidate(*activity_id);
            info!(%activity_id, ?status, "activity status advanced");
        }
        changed
    }
}

impl<S, D, R> std::fmt::Debug for SeckillManager<S, D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeckillManager")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
