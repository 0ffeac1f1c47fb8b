//! Seckill error types
//!
//! Business rejections (`OutOfStock`, `AlreadyPurchased`, `NotOpen`) are
//! outcomes, not errors; see [`SeckillOutcome`](super::types::SeckillOutcome).
//! Everything here is an infrastructure or precondition failure.

use super::queue::JournalError;
use super::types::{ActivityId, AdmissionState};
use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to the shared fast-cache tier (stock counters, dedup sets).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store could not be reached or rejected the command.
    #[error("cache store unavailable: {message}")]
    Unavailable {
        /// Underlying error message.
        message: String,
    },

    /// The stored value could not be interpreted.
    #[error("corrupt cache value for key {key}: {message}")]
    CorruptValue {
        /// Key holding the bad value.
        key: String,
        /// Description of the problem.
        message: String,
    },
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    #[cold]
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable {
            message: err.to_string(),
        }
    }
}

/// Failure talking to the persistent store (activities, orders).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The persistent store could not be reached.
    #[error("persistent store unavailable: {message}")]
    Unavailable {
        /// Underlying error message.
        message: String,
    },

    /// The order referenced by an update does not exist.
    #[error("order not found: {key}")]
    OrderNotFound {
        /// Idempotency key of the missing order.
        key: String,
    },

    /// The activity referenced by an operation does not exist.
    #[error("activity not found: {activity_id}")]
    ActivityNotFound {
        /// Missing activity.
        activity_id: ActivityId,
    },
}

/// Failure of the order persistence queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The write-ahead journal rejected the record.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// The queue consumer was already taken by a worker.
    #[error("queue consumer already taken")]
    ConsumerTaken,
}

/// Errors returned by the reservation engine.
///
/// Every variant except [`PreloadWhileOpen`](SeckillError::PreloadWhileOpen),
/// [`StockExceedsActivity`](SeckillError::StockExceedsActivity) and
/// [`ActivityNotFound`](SeckillError::ActivityNotFound) is transient:
/// the engine has rolled back whatever it applied, so callers may retry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SeckillError {
    /// The stock counter or dedup store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The activity metadata could not be loaded.
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// The reservation could not be durably enqueued.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Stock preload refused because the activity is already admitting.
    #[error("cannot modify stock of activity {activity_id} while it is {state}")]
    PreloadWhileOpen {
        /// The activity.
        activity_id: ActivityId,
        /// Its admission state at the time of the call.
        state: AdmissionState,
    },

    /// A preload asked for more units than the activity puts on sale.
    #[error(
        "cannot preload {requested} units for activity {activity_id}: its seckill stock is {seckill_stock}"
    )]
    StockExceedsActivity {
        /// The activity.
        activity_id: ActivityId,
        /// Units requested by the caller.
        requested: u64,
        /// The activity's `seckill_stock`.
        seckill_stock: u64,
    },

    /// The activity does not exist.
    #[error("activity not found: {activity_id}")]
    ActivityNotFound {
        /// The activity.
        activity_id: ActivityId,
    },

    /// The admission task was cancelled or panicked.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },

    /// The engine could not be built from its configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SeckillError {
    /// Returns `true` if the caller can safely retry the same request.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SeckillError::Store(_)
                | SeckillError::Repository(_)
                | SeckillError::Queue(_)
                | SeckillError::Internal { .. }
        )
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read config {path}: {message}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error message.
        message: String,
    },

    /// The configuration could not be parsed.
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value outside its allowed range.
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let store = SeckillError::Store(StoreError::Unavailable {
            message: "connection refused".to_string(),
        });
        assert!(store.is_retriable());

        let preload = SeckillError::PreloadWhileOpen {
            activity_id: ActivityId(3),
            state: AdmissionState::Open,
        };
        assert!(!preload.is_retriable());
        assert!(preload.to_string().contains("while it is open"));

        let missing = SeckillError::ActivityNotFound {
            activity_id: ActivityId(9),
        };
        assert!(!missing.is_retriable());

        let oversized = SeckillError::StockExceedsActivity {
            activity_id: ActivityId(3),
            requested: 11,
            seckill_stock: 10,
        };
        assert!(!oversized.is_retriable());
        assert!(oversized.to_string().contains("seckill stock is 10"));
    }

    #[test]
    fn test_queue_error_wraps_journal_error() {
        let err: QueueError = JournalError::MutexPoisoned.into();
        let seckill: SeckillError = err.into();
        assert!(seckill.is_retriable());
        assert!(seckill.to_string().contains("mutex poisoned"));
    }
}
