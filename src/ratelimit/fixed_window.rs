//! Fixed-window counter.
//!
//! One integer per client whose TTL is the window length. The counter is
//! incremented before the limit check and rolled back when over the limit,
//! so concurrent requests can never both observe a free slot.

use std::time::Duration;

use tracing::{trace, warn};

use crate::store::{CounterStore, KeyExpiry, StoreResult};

/// Fixed-window (token-bucket style) limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
}

impl FixedWindow {
    /// Allow `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request against `key`.
    ///
    /// Returns `Ok(false)` when the limit is exceeded.
    pub async fn check(&self, store: &dyn CounterStore, key: &str) -> StoreResult<bool> {
        let count = store.incr(key).await?;

        if count == 1 {
            if let Err(e) = store.expire(key, self.window).await {
                // A counter without a TTL would never reset; undo the
                // increment so the next request tries to set it again.
                if let Err(rollback) = store.decr(key).await {
                    warn!(key = %key, error = %rollback, "Failed to roll back untimed window counter");
                }
                return Err(e);
            }
        }

        trace!(key = %key, count = count, limit = self.limit, "Fixed window count");

        if count > limit_i64(self.limit) {
            if let Err(e) = store.decr(key).await {
                warn!(key = %key, error = %e, "Failed to roll back over-limit increment");
            }
            self.repair_missing_ttl(store, key).await;
            return Ok(false);
        }

        Ok(true)
    }

    /// Give an exhausted counter its TTL back if the first request never set it.
    ///
    /// Without this a counter created by an interrupted first request would
    /// keep the client rejected forever.
    async fn repair_missing_ttl(&self, store: &dyn CounterStore, key: &str) {
        match store.pttl(key).await {
            Ok(KeyExpiry::Persistent) => {
                warn!(key = %key, "Window counter has no expiry; restoring it");
                if let Err(e) = store.expire(key, self.window).await {
                    warn!(key = %key, error = %e, "Failed to restore window counter expiry");
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read window counter expiry");
            }
        }
    }
}

/// Store counters are signed; limits beyond `i64::MAX` are unreachable anyway.
pub(crate) fn limit_i64(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
