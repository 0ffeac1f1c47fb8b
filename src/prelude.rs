/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 16/10/26
******************************************************************************/

//! Prelude module that re-exports commonly used types and traits.
//!
//! ```rust
//! use seckill_rs::prelude::*;
//! ```

// Wiring
pub use crate::seckill::manager::{MemorySeckillManager, SeckillManager};
pub use crate::seckill::{ReconciliationWorker, ReservationEngine, WorkerHandle};

// Domain types
pub use crate::seckill::types::{
    Activity, ActivityId, ActivityStatus, AdmissionState, IdempotencyKey, Order, OrderStatus,
    ProductId, Reservation, SeckillOutcome, UserId,
};

// Store and repository contracts
pub use crate::seckill::repository::{ActivityRepository, MemoryStore, OrderRepository};
pub use crate::seckill::store::{
    MemoryDedupStore, MemoryStockCounter, PurchaseDedupStore, StockCounterStore,
};

// Queue
pub use crate::seckill::queue::{DeadLetter, OrderQueue};

// Configuration and errors
pub use crate::seckill::config::SeckillConfig;
pub use crate::seckill::error::{SeckillError, StoreError};
pub use crate::seckill::worker::ReconciliationReport;

// Utility functions
pub use crate::utils::current_time_millis;
