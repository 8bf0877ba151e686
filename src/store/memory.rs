//! In-memory counting store for single-instance deployments and tests.
//!
//! Mirrors the Redis semantics the limiters rely on: counters keep their TTL
//! across increments, expired keys read as missing, and a key holding a
//! counter cannot be used as a sorted set.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::{CounterStore, KeyExpiry, StoreError, StoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug)]
enum Value {
    Counter(i64),
    Sorted(BTreeSet<(i64, String)>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// Expiry deadline in epoch milliseconds.
    expires_at: Option<i64>,
}

impl Slot {
    fn counter() -> Self {
        Self {
            value: Value::Counter(0),
            expires_at: None,
        }
    }

    fn sorted() -> Self {
        Self {
            value: Value::Sorted(BTreeSet::new()),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    fn is_empty_set(&self) -> bool {
        matches!(&self.value, Value::Sorted(set) if set.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    unavailable: bool,
    latency: Option<Duration>,
}

/// A process-local [`CounterStore`].
pub struct InMemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    faults: RwLock<Faults>,
}

impl InMemoryStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().unavailable = unavailable;
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.write().latency = latency;
    }

    /// Current value of a live counter.
    pub fn counter(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        self.entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| match slot.value {
                Value::Counter(n) => Some(n),
                Value::Sorted(_) => None,
            })
    }

    /// Number of members in a live sorted set.
    pub fn cardinality(&self, key: &str) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| match &slot.value {
                Value::Sorted(set) => set.len(),
                Value::Counter(_) => 0,
            })
            .unwrap_or(0)
    }

    /// Remaining time to live of a live key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let slot = self.entries.get(key)?;
        if slot.is_expired(now) {
            return None;
        }
        slot.expires_at
            .map(|deadline| Duration::from_millis((deadline - now).max(0) as u64))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.entries
            .iter()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        debug!(
            removed = before.saturating_sub(self.entries.len()),
            "Purged expired in-memory counters"
        );
    }

    async fn preflight(&self) -> StoreResult<()> {
        let faults = *self.faults.read();
        if let Some(latency) = faults.latency {
            tokio::time::sleep(latency).await;
        }
        if faults.unavailable {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = self.clock.now_millis();
        let mut slot = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(Slot::counter);
        if slot.is_expired(now) {
            *slot = Slot::counter();
        }
        match &mut slot.value {
            Value::Counter(n) => {
                *n += delta;
                Ok(*n)
            }
            Value::Sorted(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    fn remove_if_empty_set(&self, key: &str) {
        self.entries.remove_if(key, |_, slot| slot.is_empty_set());
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.preflight().await?;
        self.add_to_counter(key, 1)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.preflight().await?;
        self.add_to_counter(key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.preflight().await?;
        let now = self.clock.now_millis();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.expires_at = Some(now + ttl.as_millis() as i64);
        }
        Ok(())
    }

    async fn pttl(&self, key: &str) -> StoreResult<KeyExpiry> {
        self.preflight().await?;
        let now = self.clock.now_millis();
        let Some(slot) = self.entries.get(key) else {
            return Ok(KeyExpiry::Missing);
        };
        if slot.is_expired(now) {
            return Ok(KeyExpiry::Missing);
        }
        Ok(match slot.expires_at {
            Some(deadline) => KeyExpiry::In(Duration::from_millis((deadline - now).max(0) as u64)),
            None => KeyExpiry::Persistent,
        })
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.preflight().await?;
        self.entries.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, score_ms: i64, member: &str) -> StoreResult<()> {
        self.preflight().await?;
        let now = self.clock.now_millis();
        let mut slot = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(Slot::sorted);
        if slot.is_expired(now) {
            *slot = Slot::sorted();
        }
        match &mut slot.value {
            Value::Sorted(set) => {
                set.retain(|(_, existing)| existing != member);
                set.insert((score_ms, member.to_owned()));
                Ok(())
            }
            Value::Counter(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn zcard(&self, key: &str) -> StoreResult<i64> {
        self.preflight().await?;
        let now = self.clock.now_millis();
        let Some(slot) = self.entries.get(key) else {
            return Ok(0);
        };
        if slot.is_expired(now) {
            return Ok(0);
        }
        match &slot.value {
            Value::Sorted(set) => Ok(set.len() as i64),
            Value::Counter(_) => Err(StoreError::WrongType(key.to_owned())),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, max_score_ms: i64) -> StoreResult<()> {
        self.preflight().await?;
        let now = self.clock.now_millis();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        {
            let Some(mut slot) = self.entries.get_mut(key) else {
                return Ok(());
            };
            match &mut slot.value {
                Value::Sorted(set) => set.retain(|(score, _)| *score > max_score_ms),
                Value::Counter(_) => return Err(StoreError::WrongType(key.to_owned())),
            }
        }
        self.remove_if_empty_set(key);
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
        self.preflight().await?;
        let now = self.clock.now_millis();
        let admitted = {
            let mut slot = self
                .entries
                .entry(key.to_owned())
                .or_insert_with(Slot::sorted);
            if slot.is_expired(now) {
                *slot = Slot::sorted();
            }
            let Value::Sorted(set) = &mut slot.value else {
                return Err(StoreError::WrongType(key.to_owned()));
            };
            set.retain(|(score, _)| *score > cutoff_ms);
            if set.len() as u64 >= limit {
                false
            } else {
                set.insert((now_ms, member.to_owned()));
                slot.expires_at = Some(now + ttl.as_millis() as i64);
                true
            }
        };
        self.remove_if_empty_set(key);
        Ok(admitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (InMemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (InMemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_incr_and_decr() {
        let (store, _) = store_with_clock();

        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        assert_eq!(store.decr("c").await.unwrap(), 1);
        assert_eq!(store.counter("c"), Some(1));
    }

    #[tokio::test]
    async fn test_decr_missing_key_goes_negative() {
        let (store, _) = store_with_clock();
        assert_eq!(store.decr("missing").await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_expire_keeps_ttl_across_increments() {
        let (store, clock) = store_with_clock();

        store.incr("c").await.unwrap();
        store.expire("c", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(4));
        store.incr("c").await.unwrap();

        assert_eq!(store.ttl("c"), Some(Duration::from_secs(6)));

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.counter("c"), None);
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.ttl("c"), None);
    }

    #[tokio::test]
    async fn test_pttl_reports_expiry_state() {
        let (store, clock) = store_with_clock();

        assert_eq!(store.pttl("c").await.unwrap(), KeyExpiry::Missing);

        store.incr("c").await.unwrap();
        assert_eq!(store.pttl("c").await.unwrap(), KeyExpiry::Persistent);

        store.expire("c", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(3));
        assert_eq!(
            store.pttl("c").await.unwrap(),
            KeyExpiry::In(Duration::from_secs(7))
        );

        clock.advance(Duration::from_secs(7));
        assert_eq!(store.pttl("c").await.unwrap(), KeyExpiry::Missing);
    }

    #[tokio::test]
    async fn test_expire_missing_key_is_noop() {
        let (store, _) = store_with_clock();
        store.expire("nothing", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_primitives() {
        let (store, _) = store_with_clock();

        store.zadd("z", 100, "a").await.unwrap();
        store.zadd("z", 200, "b").await.unwrap();
        store.zadd("z", 300, "c").await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 3);

        store.zrem_range_by_score("z", 200).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);

        store.zrem_range_by_score("z", 300).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zadd_same_member_updates_score() {
        let (store, _) = store_with_clock();

        store.zadd("z", 100, "a").await.unwrap();
        store.zadd("z", 500, "a").await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);

        store.zrem_range_by_score("z", 100).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let (store, _) = store_with_clock();

        store.incr("k").await.unwrap();
        let err = store.zadd("k", 1, "m").await.unwrap_err();
        assert_eq!(err, StoreError::WrongType("k".to_string()));
    }

    #[tokio::test]
    async fn test_sliding_window_admit_is_bounded() {
        let (store, _) = store_with_clock();
        let ttl = Duration::from_secs(10);

        for i in 0..3 {
            let admitted = store
                .sliding_window_admit("w", 1_000, 0, 3, &format!("m{}", i), ttl)
                .await
                .unwrap();
            assert!(admitted);
        }

        let admitted = store
            .sliding_window_admit("w", 1_000, 0, 3, "m3", ttl)
            .await
            .unwrap();
        assert!(!admitted);
        assert_eq!(store.cardinality("w"), 3);

        // Everything at or below the cutoff is purged first.
        let admitted = store
            .sliding_window_admit("w", 2_000, 1_000, 3, "m4", ttl)
            .await
            .unwrap();
        assert!(admitted);
        assert_eq!(store.cardinality("w"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_fault() {
        let (store, _) = store_with_clock();
        store.set_unavailable(true);

        assert!(matches!(
            store.incr("c").await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_fault() {
        let (store, _) = store_with_clock();
        store.set_latency(Some(Duration::from_secs(1)));

        let started = tokio::time::Instant::now();
        store.incr("c").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.incr("short").await.unwrap();
        store.expire("short", Duration::from_secs(1)).await.unwrap();
        store.incr("long").await.unwrap();

        clock.advance(Duration::from_secs(2));
        store.purge_expired();

        assert_eq!(store.len(), 1);
        assert_eq!(store.counter("long"), Some(1));
    }
}
