//! Redis-compatible counting store.
//!
//! Works against Redis, Dragonfly, KeyDB or anything else that speaks the
//! same commands. The connection is established lazily and shared by every
//! caller through a [`ConnectionManager`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{CounterStore, KeyExpiry, StoreError, StoreResult};
use crate::error::{Result, TurnstileError};

/// Purge, count and conditional insert for the sliding window log.
///
/// KEYS[1] = set key
/// ARGV = cutoff_ms, now_ms, limit, member, ttl_ms
const SLIDING_WINDOW_ADMIT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
    return 0
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
"#;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.code() == Some("WRONGTYPE") {
            StoreError::WrongType(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

/// A [`CounterStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    admit_script: Script,
}

impl RedisStore {
    /// Create a store for `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// Only the URL is validated here; no connection is made until the
    /// first command, so an unreachable server does not prevent startup.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            TurnstileError::Config(format!("invalid store url {}: {}", url, e))
        })?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            admit_script: Script::new(SLIDING_WINDOW_ADMIT),
        })
    }

    /// Check that the server answers `PING`.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "Failed to connect to counting store");
                        StoreError::from(e)
                    })?;
                debug!("Connected to counting store");
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = redis::cmd("DECR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pttl(&self, key: &str) -> StoreResult<KeyExpiry> {
        let mut conn = self.connection().await?;
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(key_expiry(millis))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score_ms: i64, member: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score_ms)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let count: i64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zrem_range_by_score(&self, key: &str, max_score_ms: i64) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        cutoff_ms: i64,
        limit: u64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let admitted: i64 = self
            .admit_script
            .key(key)
            .arg(cutoff_ms)
            .arg(now_ms)
            .arg(limit)
            .arg(member)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }
}

/// Decode a `PTTL` reply: -2 for a missing key, -1 for no expiry.
fn key_expiry(millis: i64) -> KeyExpiry {
    match millis {
        -2 => KeyExpiry::Missing,
        m if m < 0 => KeyExpiry::Persistent,
        m => KeyExpiry::In(Duration::from_millis(m as u64)),
    }
}

/// `PEXPIRE` rejects zero, so round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
