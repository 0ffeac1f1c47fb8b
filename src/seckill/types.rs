//! Core domain types shared by the admission path and the order pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use uuid::Uuid;

/// Namespace used to derive deterministic order numbers from idempotency keys.
const ORDER_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_94b7_4d0a_8e55_1b2c_9f70_d4e3);

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric identifier.
            #[must_use]
            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a flash-sale activity.
    ActivityId
);
id_newtype!(
    /// Identifier of a purchasing user.
    UserId
);
id_newtype!(
    /// Identifier of the product sold by an activity.
    ProductId
);

/// Lifecycle status of an activity as maintained by the administrative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    /// Created, waiting for its start time.
    Pending,
    /// Accepting purchase attempts while inside its window.
    Active,
    /// Finished; no further admissions.
    Closed,
}

/// A single flash sale: one product, one price, a fixed number of units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Activity identifier.
    pub id: ActivityId,
    /// Product being sold.
    pub product_id: ProductId,
    /// Sale price in minor currency units (e.g. cents).
    pub seckill_price: u64,
    /// Total units offered when the activity was created.
    pub seckill_stock: u64,
    /// Admission window start, Unix milliseconds (inclusive).
    pub start_time_ms: u64,
    /// Admission window end, Unix milliseconds (exclusive).
    pub end_time_ms: u64,
    /// Lifecycle status.
    pub status: ActivityStatus,
}

impl Activity {
    /// Computes the admission state of this activity at `now_ms`.
    ///
    /// The activity is open only when its status is [`ActivityStatus::Active`]
    /// and `now_ms` falls within `[start_time_ms, end_time_ms)`.
    #[must_use]
    pub fn admission_state_at(&self, now_ms: u64) -> AdmissionState {
        match self.status {
            ActivityStatus::Closed => AdmissionState::Closed,
            _ if now_ms >= self.end_time_ms => AdmissionState::Closed,
            ActivityStatus::Pending => AdmissionState::NotStarted,
            ActivityStatus::Active if now_ms < self.start_time_ms => AdmissionState::NotStarted,
            ActivityStatus::Active => AdmissionState::Open,
        }
    }
}

/// Whether an activity currently accepts purchase attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionState {
    /// The window has not opened yet (or the activity is still pending).
    NotStarted,
    /// Purchase attempts are admitted.
    Open,
    /// The window has passed or the activity was closed.
    Closed,
    /// No such activity.
    NotFound,
}

impl AdmissionState {
    /// Returns `true` only for [`AdmissionState::Open`].
    #[must_use]
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, AdmissionState::Open)
    }
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdmissionState::NotStarted => "not_started",
            AdmissionState::Open => "open",
            AdmissionState::Closed => "closed",
            AdmissionState::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// Deterministic key tying one admitted reservation to at most one order.
///
/// Derived from `(activity, user)`, which the dedup store makes unique per
/// activity, so a redelivered reservation always carries the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives the key for a user's reservation in an activity.
    ///
    /// The key is the lowercase hex SHA-256 of `seckill:{activity}:{user}`.
    #[must_use]
    pub fn derive(activity_id: ActivityId, user_id: UserId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(format!("seckill:{activity_id}:{user_id}").as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Returns the key as a string slice.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic order number for the order created from this key.
    #[must_use]
    pub fn order_no(&self) -> Uuid {
        Uuid::new_v5(&ORDER_NAMESPACE, self.0.as_bytes())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeckillOutcome {
    /// The user won a unit; an order will be persisted asynchronously.
    Won {
        /// Key under which the resulting order will be recorded.
        idempotency_key: IdempotencyKey,
    },
    /// No units left.
    OutOfStock,
    /// The user already holds a reservation for this activity.
    AlreadyPurchased,
    /// The activity is not accepting attempts (not started, closed or unknown).
    NotOpen,
}

impl SeckillOutcome {
    /// Returns `true` for [`SeckillOutcome::Won`].
    #[must_use]
    #[inline]
    pub fn is_won(&self) -> bool {
        matches!(self, SeckillOutcome::Won { .. })
    }

    /// Short label, used for logging and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SeckillOutcome::Won { .. } => "won",
            SeckillOutcome::OutOfStock => "out_of_stock",
            SeckillOutcome::AlreadyPurchased => "already_purchased",
            SeckillOutcome::NotOpen => "not_open",
        }
    }
}

impl fmt::Display for SeckillOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted purchase waiting to be turned into an order.
///
/// Reservations only live in the order queue; they are never stored as a
/// separate entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// The winning user.
    pub user_id: UserId,
    /// The activity the unit was taken from.
    pub activity_id: ActivityId,
    /// When the reservation was admitted, Unix milliseconds.
    pub reserved_at_ms: u64,
    /// Key used to deduplicate order creation.
    pub idempotency_key: IdempotencyKey,
}

impl Reservation {
    /// Creates a reservation with its derived idempotency key.
    #[must_use]
    pub fn new(user_id: UserId, activity_id: ActivityId, reserved_at_ms: u64) -> Self {
        Self {
            user_id,
            activity_id,
            reserved_at_ms,
            idempotency_key: IdempotencyKey::derive(activity_id, user_id),
        }
    }
}

/// Status of a persisted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Written, audit stock not yet applied.
    Created,
    /// Written and accounted against the activity's audit stock.
    Confirmed,
    /// Could not be completed; kept for manual inspection.
    Failed,
}

/// The durable record of a completed sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Generated order number.
    pub order_no: Uuid,
    /// Key of the reservation this order was created from.
    pub idempotency_key: IdempotencyKey,
    /// Buyer.
    pub user_id: UserId,
    /// Activity the unit was sold in.
    pub activity_id: ActivityId,
    /// Product sold.
    pub product_id: ProductId,
    /// Price paid in minor currency units.
    pub price: u64,
    /// Order status.
    pub status: OrderStatus,
    /// Creation time, Unix milliseconds.
    pub created_at_ms: u64,
}

impl Order {
    /// Builds a freshly created order for a reservation in `activity`.
    #[must_use]
    pub fn from_reservation(reservation: &Reservation, activity: &Activity, now_ms: u64) -> Self {
        Self {
            order_no: reservation.idempotency_key.order_no(),
            idempotency_key: reservation.idempotency_key.clone(),
            user_id: reservation.user_id,
            activity_id: reservation.activity_id,
            product_id: activity.product_id,
            price: activity.seckill_price,
            status: OrderStatus::Created,
            created_at_ms: now_ms,
        }
    }
}
