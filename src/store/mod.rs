//! Shared counter store.
//!
//! All cross-request and cross-process coordination happens through a
//! [`CounterStore`]: atomic integer counters with expiry, plus a sorted set
//! keyed by millisecond timestamps. The admission controller never holds
//! local state of its own.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryStore;
pub use self::redis_store::RedisStore;

/// Errors returned by a counting store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("counting store unavailable: {0}")]
    Unavailable(String),

    /// A call did not complete within its deadline.
    #[error("counting store call timed out after {0:?}")]
    Timeout(Duration),

    /// The key holds a value of a different type.
    #[error("wrong value type for key {0}")]
    WrongType(String),
}

/// Expiry state of a key, as reported by `PTTL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExpiry {
    /// The key does not exist.
    Missing,
    /// The key exists but never expires.
    Persistent,
    /// The key expires after the given time.
    In(Duration),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The primitives the admission controller needs from a counting store.
///
/// Every method is a single round trip and a single atomic mutation.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` (created at 0 if missing), returning the new value.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Atomically decrement `key` (created at 0 if missing), returning the new value.
    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Set the time to live of an existing key. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining time to live of `key`.
    async fn pttl(&self, key: &str) -> StoreResult<KeyExpiry>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Add `member` to the sorted set at `key` with the given score.
    async fn zadd(&self, key: &str, score_ms: i64, member: &str) -> StoreResult<()>;

    /// Number of members in the sorted set at `key` (0 if missing).
    async fn zcard(&self, key: &str) -> StoreResult<i64>;

    /// Remove every member scored in `-inf..=max_score_ms`.
    async fn zrem_range_by_score(&self, key: &str, max_score_ms: i64) -> StoreResult<()>;

    /// Purge, count and conditionally insert in one atomic step.
    ///
    /// Removes members scored at or below `cutoff_ms`; if fewer than `limit`
    /// remain, inserts `member` at `now_ms`, refreshes the TTL and returns
    /// `true`. Otherwise leaves the set untouched and returns `false`.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now_ms: i64,
        cutoff_ms: i64,
        limit: u64,
        member: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;
}
