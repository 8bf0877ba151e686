//! Admission decisions: rate check, then concurrency check, then a lease that
//! is released on every exit path.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::AdmissionSettings;
use crate::ratelimit::{ClientKey, ConcurrencyLimiter, Lease, RateLimiter};
use crate::store::{CounterStore, StoreError, StoreResult};

/// What to do when the counting store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and record the decision as degraded.
    #[default]
    Open,
    /// Reject the request as unavailable.
    Closed,
}

/// Why a request was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The client exhausted its request rate for the current window.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The client already has the maximum number of requests in flight.
    #[error("too many concurrent requests")]
    TooManyConcurrent,

    /// The store is unreachable and the failure policy is closed.
    #[error("admission control unavailable")]
    Unavailable,
}

/// Counters describing admission outcomes since startup.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    admitted: AtomicU64,
    rejected_rate: AtomicU64,
    rejected_concurrency: AtomicU64,
    rejected_unavailable: AtomicU64,
    degraded: AtomicU64,
}

impl AdmissionStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_rate: self.rejected_rate.load(Ordering::Relaxed),
            rejected_concurrency: self.rejected_concurrency.load(Ordering::Relaxed),
            rejected_unavailable: self.rejected_unavailable.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the admission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub admitted: u64,
    pub rejected_rate: u64,
    pub rejected_concurrency: u64,
    pub rejected_unavailable: u64,
    /// Store calls that failed or timed out.
    pub degraded: u64,
}

/// Composes the rate limiter and the concurrency limiter.
pub struct AdmissionController {
    rate_limiter: RateLimiter,
    concurrency: ConcurrencyLimiter,
    store_timeout: Duration,
    failure_policy: FailurePolicy,
    stats: AdmissionStats,
}

impl AdmissionController {
    /// Create a controller that bounds every store call by `store_timeout`.
    pub fn new(
        rate_limiter: RateLimiter,
        concurrency: ConcurrencyLimiter,
        store_timeout: Duration,
    ) -> Self {
        Self {
            rate_limiter,
            concurrency,
            store_timeout,
            failure_policy: FailurePolicy::Open,
            stats: AdmissionStats::default(),
        }
    }

    /// Build both limiters and the controller from validated settings.
    pub fn from_settings(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        settings: &AdmissionSettings,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            store.clone(),
            clock,
            settings.algorithm,
            settings.limit,
            settings.window,
        )
        .with_atomic_sliding_window(settings.sliding_window_atomic)
        .with_key_prefix(settings.key_prefix.clone());

        let concurrency =
            ConcurrencyLimiter::new(store, settings.max_concurrent, settings.lease_ttl)
                .with_key_prefix(settings.key_prefix.clone());

        Self::new(rate_limiter, concurrency, settings.store_timeout)
            .with_failure_policy(settings.failure_policy)
    }

    /// Set the store failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// The concurrency limiter.
    pub fn concurrency_limiter(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    /// The store failure policy.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Admission counters.
    pub fn stats(&self) -> &AdmissionStats {
        &self.stats
    }

    /// Decide whether `client` may start another request.
    ///
    /// On success the returned [`Admission`] owns the concurrency lease, if
    /// one was taken; it must be released (or dropped) when the request ends.
    #[instrument(level = "debug", skip_all, fields(client = %client))]
    pub async fn admit(self: &Arc<Self>, client: &ClientKey) -> Result<Admission, Rejection> {
        let mut degraded = false;

        match self.check_rate_detached(client).await {
            Ok(true) => {}
            Ok(false) => {
                self.stats.rejected_rate.fetch_add(1, Ordering::Relaxed);
                return Err(Rejection::RateLimited);
            }
            Err(e) => {
                self.degrade("rate_check", client, &e)?;
                degraded = true;
            }
        }

        let guard = match self.acquire_detached(client).await {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                self.stats.rejected_concurrency.fetch_add(1, Ordering::Relaxed);
                return Err(Rejection::TooManyConcurrent);
            }
            Err(e) => {
                self.degrade("acquire", client, &e)?;
                degraded = true;
                None
            }
        };

        self.stats.admitted.fetch_add(1, Ordering::Relaxed);
        debug!(degraded = degraded, "Request admitted");

        Ok(Admission { guard, degraded })
    }

    /// Give a lease back, waiting at most the store timeout.
    ///
    /// Failures are logged; the lease TTL reclaims the slot eventually.
    pub async fn release(self: &Arc<Self>, lease: Lease) {
        let client = lease.client().clone();
        let controller = Arc::clone(self);
        let outcome = self
            .detached(async move { controller.concurrency.release(lease).await })
            .await;
        if let Err(e) = outcome {
            self.stats.degraded.fetch_add(1, Ordering::Relaxed);
            warn!(client = %client, error = %e, "Failed to release lease; relying on lease TTL");
        }
    }

    /// Count one request against the rate limit in a task that outlives the caller.
    async fn check_rate_detached(self: &Arc<Self>, client: &ClientKey) -> StoreResult<bool> {
        let controller = Arc::clone(self);
        let client = client.clone();
        self.detached(async move { controller.rate_limiter.check(&client).await })
            .await
    }

    /// Take a lease in a task that outlives the caller.
    ///
    /// If the caller times out or is cancelled while the store round trip is
    /// in flight, the grant is never lost: the guard it travels in releases
    /// the lease when it is dropped unclaimed.
    async fn acquire_detached(
        self: &Arc<Self>,
        client: &ClientKey,
    ) -> StoreResult<Option<LeaseGuard>> {
        let controller = Arc::clone(self);
        let client = client.clone();
        self.detached(async move {
            let lease = controller.concurrency.acquire(&client).await?;
            Ok(lease.map(|lease| LeaseGuard {
                controller: Arc::clone(&controller),
                lease: Some(lease),
            }))
        })
        .await
    }

    /// Run a store sequence on its own task and wait for it at most
    /// `store_timeout`.
    ///
    /// Giving up on the wait never interrupts the sequence, so a multi-step
    /// update always reaches its expiry step. The task itself is bounded by
    /// the lease TTL. An outcome nobody is waiting for is dropped.
    async fn detached<T, F>(&self, work: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let limit = self.concurrency.lease_ttl();

        tokio::spawn(async move {
            let outcome = match timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(limit)),
            };
            let _ = tx.send(outcome);
        });

        match timeout(self.store_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(StoreError::Unavailable(
                "store task ended without a result".to_string(),
            )),
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    fn degrade(&self, stage: &str, client: &ClientKey, error: &StoreError) -> Result<(), Rejection> {
        self.stats.degraded.fetch_add(1, Ordering::Relaxed);
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(stage = stage, client = %client, error = %error, "Counting store failure; failing open");
                Ok(())
            }
            FailurePolicy::Closed => {
                warn!(stage = stage, client = %client, error = %error, "Counting store failure; failing closed");
                self.stats.rejected_unavailable.fetch_add(1, Ordering::Relaxed);
                Err(Rejection::Unavailable)
            }
        }
    }
}

/// A granted request.
#[must_use = "dropping an admission releases its lease in the background"]
#[derive(Debug)]
pub struct Admission {
    guard: Option<LeaseGuard>,
    degraded: bool,
}

impl Admission {
    /// Whether any store call failed while admitting this request.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// The concurrency lease, absent when acquisition failed open.
    pub fn lease(&self) -> Option<&Lease> {
        self.guard.as_ref().and_then(|guard| guard.lease.as_ref())
    }

    /// Release the lease now.
    pub async fn release(self) {
        if let Some(guard) = self.guard {
            guard.release().await;
        }
    }
}

/// Owns a lease and gives it back exactly once.
///
/// [`LeaseGuard::release`] is the normal path. Dropping an unreleased guard
/// (handler panic, cancelled request) spawns the release on the current
/// runtime instead.
pub struct LeaseGuard {
    controller: Arc<AdmissionController>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    /// Release the lease and wait for the store to acknowledge it.
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            self.controller.release(lease).await;
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(client = %lease.client(), "Releasing abandoned lease");
                let controller = Arc::clone(&self.controller);
                handle.spawn(async move {
                    controller.release(lease).await;
                });
            }
            Err(_) => {
                warn!(
                    client = %lease.client(),
                    "No runtime to release abandoned lease; it expires with the lease TTL"
                );
            }
        }
    }
}
