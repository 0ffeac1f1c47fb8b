//! Flash-sale admission control.
//!
//! Leaves first:
//!
//! - [`store`]: stock counters and purchase sets in the shared fast-cache tier
//! - [`oracle`]: cached activity-window checks
//! - [`engine`]: the admission decision
//! - [`queue`]: the write-ahead order queue
//! - [`worker`]: order persistence and crash reconciliation
//! - [`manager`]: wiring

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod oracle;
pub mod queue;
pub mod repository;
pub mod store;
pub mod types;
pub mod worker;

pub use config::SeckillConfig;
pub use engine::ReservationEngine;
pub use error::{ConfigError, QueueError, RepositoryError, SeckillError, StoreError};
pub use manager::{MemorySeckillManager, SeckillManager};
pub use oracle::ActivityWindowOracle;
pub use queue::{DeadLetter, Delivery, JournalError, OrderQueue, QueueConsumer, QueueRecord};
pub use repository::{ActivityRepository, MemoryStore, OrderRepository};
pub use store::{MemoryDedupStore, MemoryStockCounter, PurchaseDedupStore, StockCounterStore};
pub use types::{
    Activity, ActivityId, ActivityStatus, AdmissionState, IdempotencyKey, Order, OrderStatus,
    ProductId, Reservation, SeckillOutcome, UserId,
};
pub use worker::{ProcessOutcome, ReconciliationReport, ReconciliationWorker, WorkerHandle};
