//! Concurrency limiter.
//!
//! Counts in-flight requests per client with an optimistic increment that is
//! rolled back when over the cap. The counter carries a TTL so leases held by
//! a gateway that crashed before releasing are eventually reclaimed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::client_key::ClientKey;
use super::fixed_window::limit_i64;
use crate::store::{CounterStore, StoreResult};

/// Default namespace for lease counters.
pub const CONCURRENCY_NAMESPACE: &str = "concurrency";

/// Proof that one concurrency slot was granted.
///
/// Only [`ConcurrencyLimiter::acquire`] creates leases and
/// [`ConcurrencyLimiter::release`] consumes them, so a slot can be given back
/// at most once and only by its holder.
#[derive(Debug, PartialEq, Eq)]
pub struct Lease {
    key: String,
    client: ClientKey,
}

impl Lease {
    /// Store key of the lease counter.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Client the lease was granted to.
    pub fn client(&self) -> &ClientKey {
        &self.client
    }
}

/// Lease-counted admission of simultaneous requests.
pub struct ConcurrencyLimiter {
    store: Arc<dyn CounterStore>,
    max_concurrent: u64,
    lease_ttl: Duration,
    key_prefix: String,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `max_concurrent` leases per client.
    pub fn new(store: Arc<dyn CounterStore>, max_concurrent: u64, lease_ttl: Duration) -> Self {
        Self {
            store,
            max_concurrent,
            lease_ttl,
            key_prefix: String::new(),
        }
    }

    /// Prefix every store key with `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Maximum simultaneous leases per client.
    pub fn max_concurrent(&self) -> u64 {
        self.max_concurrent
    }

    /// Safety-net expiry of the lease counter.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Store key holding the lease count for `client`.
    pub fn lease_key(&self, client: &ClientKey) -> String {
        format!("{}{}:{}", self.key_prefix, CONCURRENCY_NAMESPACE, client)
    }

    /// Try to take one slot for `client`.
    ///
    /// Returns `Ok(None)` when the client already holds `max_concurrent` leases.
    pub async fn acquire(&self, client: &ClientKey) -> StoreResult<Option<Lease>> {
        let key = self.lease_key(client);
        let held = self.store.incr(&key).await?;

        if held > limit_i64(self.max_concurrent) {
            if let Err(e) = self.store.decr(&key).await {
                warn!(key = %key, error = %e, "Failed to roll back over-cap lease increment");
            }
            debug!(
                client = %client,
                held = held - 1,
                max = self.max_concurrent,
                "Concurrency cap reached"
            );
            return Ok(None);
        }

        // Refresh the safety net on every grant, the first one included.
        if let Err(e) = self.store.expire(&key, self.lease_ttl).await {
            if let Err(rollback) = self.store.decr(&key).await {
                warn!(key = %key, error = %rollback, "Failed to roll back untimed lease");
            }
            return Err(e);
        }

        trace!(client = %client, held = held, "Lease granted");
        Ok(Some(Lease {
            key,
            client: client.clone(),
        }))
    }

    /// Give a slot back.
    ///
    /// A count at or below zero (e.g. after the TTL reclaimed the counter
    /// while the lease was held) deletes the key instead of leaving it negative.
    pub async fn release(&self, lease: Lease) -> StoreResult<()> {
        let remaining = self.store.decr(&lease.key).await?;
        if remaining <= 0 {
            self.store.del(&lease.key).await?;
        }
        trace!(client = %lease.client, remaining = remaining.max(0), "Lease released");
        Ok(())
    }
}
