//! Sliding-window log.
//!
//! Each admitted request leaves a timestamped marker in a sorted set; markers
//! older than the window are purged before counting.
//!
//! The default sequence (purge, count, insert) spans three round trips and
//! can over-admit slightly when one client bursts concurrently. Enabling
//! `atomic` runs the whole sequence as one store-side operation instead.

use std::time::Duration;

use tracing::trace;
use uuid::Uuid;

use super::fixed_window::limit_i64;
use crate::store::{CounterStore, StoreResult};

/// Sliding-window log limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowLog {
    limit: u64,
    window: Duration,
    atomic: bool,
}

impl SlidingWindowLog {
    /// Allow `limit` requests in any rolling `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            atomic: false,
        }
    }

    /// Use the single-operation purge/count/insert variant.
    pub fn with_atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether the atomic variant is in use.
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Count one request at `now_ms` against `key`.
    ///
    /// Returns `Ok(false)` when the limit is exceeded; rejected requests leave
    /// no marker behind.
    pub async fn check(
        &self,
        store: &dyn CounterStore,
        key: &str,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let cutoff_ms = now_ms - self.window.as_millis() as i64;
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        if self.atomic {
            return store
                .sliding_window_admit(key, now_ms, cutoff_ms, self.limit, &member, self.window)
                .await;
        }

        store.zrem_range_by_score(key, cutoff_ms).await?;

        let count = store.zcard(key).await?;
        trace!(key = %key, count = count, limit = self.limit, "Sliding window count");
        if count >= limit_i64(self.limit) {
            return Ok(false);
        }

        store.zadd(key, now_ms, &member).await?;
        store.expire(key, self.window).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn fixture() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    async fn run_aging_scenario(log: SlidingWindowLog) {
        let (store, clock) = fixture();

        for _ in 0..5 {
            assert!(log.check(&store, "k", clock.now_millis()).await.unwrap());
        }

        clock.advance(Duration::from_secs(5));
        assert!(!log.check(&store, "k", clock.now_millis()).await.unwrap());
        assert_eq!(store.cardinality("k"), 5);

        clock.advance(Duration::from_secs(6));
        assert!(log.check(&store, "k", clock.now_millis()).await.unwrap());
        assert_eq!(store.cardinality("k"), 1);
    }

    #[tokio::test]
    async fn test_entries_age_out() {
        run_aging_scenario(SlidingWindowLog::new(5, Duration::from_secs(10))).await;
    }

    #[tokio::test]
    async fn test_entries_age_out_atomic() {
        run_aging_scenario(SlidingWindowLog::new(5, Duration::from_secs(10)).with_atomic(true))
            .await;
    }

    #[tokio::test]
    async fn test_same_millisecond_entries_are_distinct() {
        let (store, clock) = fixture();
        let log = SlidingWindowLog::new(3, Duration::from_secs(1));

        for _ in 0..3 {
            assert!(log.check(&store, "k", clock.now_millis()).await.unwrap());
        }
        assert_eq!(store.cardinality("k"), 3);
    }

    #[tokio::test]
    async fn test_refreshes_ttl() {
        let (store, clock) = fixture();
        let log = SlidingWindowLog::new(3, Duration::from_secs(10));

        log.check(&store, "k", clock.now_millis()).await.unwrap();
        clock.advance(Duration::from_secs(4));
        log.check(&store, "k", clock.now_millis()).await.unwrap();

        assert_eq!(store.ttl("k"), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_atomic_variant_never_over_admits() {
        let (store, clock) = fixture();
        let store = Arc::new(store);
        let log = SlidingWindowLog::new(10, Duration::from_secs(60)).with_atomic(true);
        let now = clock.now_millis();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { log.check(store.as_ref(), "burst", now).await })
            })
            .collect();

        let mut admitted = 0;
        for result in futures::future::join_all(tasks).await {
            if result.unwrap().unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
        assert_eq!(store.cardinality("burst"), 10);
    }
}
