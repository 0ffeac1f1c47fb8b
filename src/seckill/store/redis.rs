//! Redis store backends.
//!
//! Keys follow the deployed layout:
//!
//! - `seckill:stock:{activity}`: string counter of remaining units
//! - `seckill:user:{activity}`: set of user IDs holding a reservation
//!
//! Decrement-if-positive and restore-if-present run as Lua scripts so each
//! is one atomic step on the server, visible to every process sharing the
//! instance.
//!
//! # Feature Gate
//!
//! ```toml
//! [dependencies]
//! seckill-rs = { version = "0.1", features = ["redis"] }
//! ```

use super::{PurchaseDedupStore, StockCounterStore};
use crate::seckill::error::StoreError;
use crate::seckill::types::{ActivityId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use tracing::trace;

const DECREMENT_IF_POSITIVE: &str = r"
local v = tonumber(redis.call('GET', KEYS[1]) or '0')
if v > 0 then
  redis.call('DECR', KEYS[1])
  return 1
end
return 0
";

const INCREMENT_IF_PRESENT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('INCR', KEYS[1])
end
return -1
";

/// Key of the stock counter for an activity.
#[must_use]
pub fn stock_key(activity_id: ActivityId) -> String {
    format!("seckill:stock:{activity_id}")
}

/// Key of the purchase set for an activity.
#[must_use]
pub fn dedup_key(activity_id: ActivityId) -> String {
    format!("seckill:user:{activity_id}")
}

async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = Client::open(redis_url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Stock counters held in Redis.
#[derive(Clone)]
pub struct RedisStockCounter {
    conn_manager: ConnectionManager,
    decrement: Arc<Script>,
    restore: Arc<Script>,
}

impl RedisStockCounter {
    /// Connect to Redis at `redis_url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection cannot be
    /// established.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::with_connection(connect(redis_url).await?))
    }

    /// Build on an existing connection manager.
    #[must_use]
    pub fn with_connection(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            decrement: Arc::new(Script::new(DECREMENT_IF_POSITIVE)),
            restore: Arc::new(Script::new(INCREMENT_IF_PRESENT)),
        }
    }
}

impl std::fmt::Debug for RedisStockCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStockCounter").finish_non_exhaustive()
    }
}

impl StockCounterStore for RedisStockCounter {
    async fn preload_stock(&self, activity_id: ActivityId, stock: u64) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.set(stock_key(activity_id), stock).await?;
        trace!(%activity_id, stock, "stock preloaded in redis");
        Ok(())
    }

    async fn try_decrement(&self, activity_id: ActivityId) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let taken: i64 = self
            .decrement
            .key(stock_key(activity_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    async fn peek_stock(&self, activity_id: ActivityId) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let key = stock_key(activity_id);
        let raw: Option<String> = conn.get(&key).await?;
        raw.map(|value| {
            value.parse::<u64>().map_err(|e| StoreError::CorruptValue {
                key: key.clone(),
                message: e.to_string(),
            })
        })
        .transpose()
    }

    async fn restore_unit(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = self
            .restore
            .key(stock_key(activity_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(stock_key(activity_id)).await?;
        Ok(())
    }
}

/// Purchase sets held in Redis.
#[derive(Clone)]
pub struct RedisDedupStore {
    conn_manager: ConnectionManager,
}

impl RedisDedupStore {
    /// Connect to Redis at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection cannot be
    /// established.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::with_connection(connect(redis_url).await?))
    }

    /// Build on an existing connection manager.
    #[must_use]
    pub fn with_connection(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }
}

impl std::fmt::Debug for RedisDedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDedupStore").finish_non_exhaustive()
    }
}

impl PurchaseDedupStore for RedisDedupStore {
    async fn try_mark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let added: i64 = conn.sadd(dedup_key(activity_id), user_id.as_u64()).await?;
        Ok(added == 1)
    }

    async fn unmark_purchased(
        &self,
        activity_id: ActivityId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: i64 = conn.srem(dedup_key(activity_id), user_id.as_u64()).await?;
        Ok(())
    }

    async fn purchasers(&self, activity_id: ActivityId) -> Result<Vec<UserId>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut users: Vec<u64> = conn.smembers(dedup_key(activity_id)).await?;
        users.sort_unstable();
        Ok(users.into_iter().map(UserId).collect())
    }

    async fn purchase_count(&self, activity_id: ActivityId) -> Result<u64, StoreError> {
        let mut conn = self.conn_manager.clone();
        Ok(conn.scard(dedup_key(activity_id)).await?)
    }

    async fn clear(&self, activity_id: ActivityId) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn.del(dedup_key(activity_id)).await?;
        Ok(())
    }
}
