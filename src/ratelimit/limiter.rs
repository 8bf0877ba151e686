//! Core rate limiter implementation.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::client_key::ClientKey;
use super::fixed_window::FixedWindow;
use super::sliding_window::SlidingWindowLog;
use crate::clock::Clock;
use crate::store::{CounterStore, StoreResult};

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Fixed-window counter with TTL-bounded buckets.
    #[default]
    #[serde(alias = "token-bucket")]
    FixedWindow,
    /// Sliding-window log of request timestamps.
    SlidingWindow,
}

impl Algorithm {
    /// Default key namespace for this algorithm's counters.
    pub fn namespace(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "tokenbucket",
            Algorithm::SlidingWindow => "sliding",
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fixed-window" | "token-bucket" => Ok(Algorithm::FixedWindow),
            "sliding-window" => Ok(Algorithm::SlidingWindow),
            other => Err(format!("unknown rate limiting algorithm: {}", other)),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::FixedWindow => f.write_str("fixed-window"),
            Algorithm::SlidingWindow => f.write_str("sliding-window"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    Fixed(FixedWindow),
    Sliding(SlidingWindowLog),
}

/// Decides whether a client may make another request in the current window.
///
/// Holds no counters itself; every decision is a fresh round trip to the
/// shared store, so any number of gateway processes can share one limit.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    strategy: Strategy,
    key_prefix: String,
}

impl RateLimiter {
    /// Create a rate limiter allowing `limit` requests per `window`.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        algorithm: Algorithm,
        limit: u64,
        window: Duration,
    ) -> Self {
        let strategy = match algorithm {
            Algorithm::FixedWindow => Strategy::Fixed(FixedWindow::new(limit, window)),
            Algorithm::SlidingWindow => Strategy::Sliding(SlidingWindowLog::new(limit, window)),
        };

        debug!(
            algorithm = %algorithm,
            limit = limit,
            window = ?window,
            "Creating rate limiter"
        );

        Self {
            store,
            clock,
            strategy,
            key_prefix: String::new(),
        }
    }

    /// Run the sliding window as a single atomic store operation.
    ///
    /// Has no effect on the fixed-window algorithm.
    pub fn with_atomic_sliding_window(mut self, atomic: bool) -> Self {
        if let Strategy::Sliding(log) = self.strategy {
            self.strategy = Strategy::Sliding(log.with_atomic(atomic));
        }
        self
    }

    /// Prefix every store key with `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// The configured algorithm.
    pub fn algorithm(&self) -> Algorithm {
        match self.strategy {
            Strategy::Fixed(_) => Algorithm::FixedWindow,
            Strategy::Sliding(_) => Algorithm::SlidingWindow,
        }
    }

    /// Maximum requests per window.
    pub fn limit(&self) -> u64 {
        match self.strategy {
            Strategy::Fixed(w) => w.limit(),
            Strategy::Sliding(w) => w.limit(),
        }
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        match self.strategy {
            Strategy::Fixed(w) => w.window(),
            Strategy::Sliding(w) => w.window(),
        }
    }

    /// Default namespace for this limiter's counters.
    pub fn namespace(&self) -> &'static str {
        self.algorithm().namespace()
    }

    /// Store key of the window counter for `client` in `namespace`.
    pub fn window_key(&self, client: &ClientKey, namespace: &str) -> String {
        format!("{}{}:{}", self.key_prefix, namespace, client)
    }

    /// Count one request from `client` in the default namespace.
    pub async fn check(&self, client: &ClientKey) -> StoreResult<bool> {
        self.allow(client, self.namespace()).await
    }

    /// Count one request from `client` in `namespace`.
    ///
    /// `Ok(false)` means the limit is exceeded. An error means the store could
    /// not be consulted; what to do about it is the caller's policy.
    pub async fn allow(&self, client: &ClientKey, namespace: &str) -> StoreResult<bool> {
        let key = self.window_key(client, namespace);

        trace!(key = %key, "Checking rate limit");

        let allowed = match self.strategy {
            Strategy::Fixed(window) => window.check(self.store.as_ref(), &key).await?,
            Strategy::Sliding(log) => {
                log.check(self.store.as_ref(), &key, self.clock.now_millis())
                    .await?
            }
        };

        if !allowed {
            debug!(client = %client, namespace = %namespace, "Rate limit exceeded");
        }

        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    fn create_test_limiter(
        algorithm: Algorithm,
        limit: u64,
        window: Duration,
    ) -> (RateLimiter, Arc<InMemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store.clone(), clock.clone(), algorithm, limit, window);
        (limiter, store, clock)
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("fixed-window".parse::<Algorithm>(), Ok(Algorithm::FixedWindow));
        assert_eq!("Token-Bucket".parse::<Algorithm>(), Ok(Algorithm::FixedWindow));
        assert_eq!("sliding_window".parse::<Algorithm>(), Ok(Algorithm::SlidingWindow));
        assert!("leaky-bucket".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_algorithm_namespaces() {
        assert_eq!(Algorithm::FixedWindow.namespace(), "tokenbucket");
        assert_eq!(Algorithm::SlidingWindow.namespace(), "sliding");
    }

    #[tokio::test]
    async fn test_fixed_window_twelve_requests() {
        let (limiter, _, _) =
            create_test_limiter(Algorithm::FixedWindow, 10, Duration::from_secs(60));
        let client = ClientKey::new("1.2.3.4");

        for i in 1..=10 {
            assert!(limiter.check(&client).await.unwrap(), "Request {} should be allowed", i);
        }
        for i in 11..=12 {
            assert!(!limiter.check(&client).await.unwrap(), "Request {} should be rejected", i);
        }
    }

    #[tokio::test]
    async fn test_fixed_window_fresh_window_after_expiry() {
        let (limiter, store, clock) =
            create_test_limiter(Algorithm::FixedWindow, 2, Duration::from_secs(60));
        let client = ClientKey::new("1.2.3.4");

        assert!(limiter.check(&client).await.unwrap());
        let key = limiter.window_key(&client, limiter.namespace());
        assert!(store.ttl(&key).unwrap() <= Duration::from_secs(60));

        clock.advance(Duration::from_secs(60) + Duration::from_millis(1));
        assert!(limiter.check(&client).await.unwrap());
        assert_eq!(store.counter(&key), Some(1));
    }

    #[tokio::test]
    async fn test_sliding_window_scenario() {
        let (limiter, _, clock) =
            create_test_limiter(Algorithm::SlidingWindow, 5, Duration::from_secs(10));
        let client = ClientKey::new("1.2.3.4");

        for _ in 0..5 {
            assert!(limiter.check(&client).await.unwrap());
        }

        clock.advance(Duration::from_secs(5));
        assert!(!limiter.check(&client).await.unwrap());

        clock.advance(Duration::from_secs(6));
        assert!(limiter.check(&client).await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let (limiter, store, _) =
            create_test_limiter(Algorithm::FixedWindow, 1, Duration::from_secs(60));
        let client = ClientKey::new("c");

        assert!(limiter.allow(&client, "api").await.unwrap());
        assert!(!limiter.allow(&client, "api").await.unwrap());
        assert!(limiter.allow(&client, "uploads").await.unwrap());

        assert_eq!(store.counter("api:c"), Some(1));
        assert_eq!(store.counter("uploads:c"), Some(1));
    }

    #[tokio::test]
    async fn test_clients_are_independent() {
        let (limiter, _, _) =
            create_test_limiter(Algorithm::FixedWindow, 1, Duration::from_secs(60));

        assert!(limiter.check(&ClientKey::new("a")).await.unwrap());
        assert!(!limiter.check(&ClientKey::new("a")).await.unwrap());
        assert!(limiter.check(&ClientKey::new("b")).await.unwrap());
    }

    #[tokio::test]
    async fn test_key_prefix() {
        let (limiter, store, _) =
            create_test_limiter(Algorithm::SlidingWindow, 3, Duration::from_secs(1));
        let limiter = limiter.with_key_prefix("gw:");
        let client = ClientKey::new("c");

        limiter.check(&client).await.unwrap();
        assert_eq!(store.cardinality("gw:sliding:c"), 1);
    }

    #[tokio::test]
    async fn test_atomic_flag_only_applies_to_sliding_window() {
        let (limiter, _, _) =
            create_test_limiter(Algorithm::FixedWindow, 3, Duration::from_secs(1));
        let limiter = limiter.with_atomic_sliding_window(true);
        assert_eq!(limiter.algorithm(), Algorithm::FixedWindow);
    }

    #[tokio::test]
    async fn test_store_error_is_returned() {
        let (limiter, store, _) =
            create_test_limiter(Algorithm::SlidingWindow, 3, Duration::from_secs(1));
        store.set_unavailable(true);

        assert!(limiter.check(&ClientKey::new("c")).await.is_err());
    }
}
