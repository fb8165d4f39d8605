//! Lease lock manager.
//!
//! Locks are leases: a holder that crashes loses the lock once its TTL
//! lapses. Mutual exclusion is therefore best effort, and callers confirm
//! ownership with [`LockManager::is_owner`] right before committing a side
//! effect rather than only at the start of an operation.

use async_trait::async_trait;
use chrono::Utc;
use concord_core::{ConcordResult, LeaseToken, LockError, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

/// Short-lived mutual exclusion keyed by resource.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Lease `resource_key` for `ttl`, or fail with `LockError::Busy` while
    /// another unexpired lease exists.
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: Uuid,
        ttl: Duration,
    ) -> ConcordResult<LeaseToken>;

    /// Release a lease. Returns `false` if it had already lapsed or been
    /// taken over; a newer holder's lease is never removed.
    async fn release(&self, token: LeaseToken) -> ConcordResult<bool>;

    /// Whether any unexpired lease exists for `resource_key`.
    async fn is_held(&self, resource_key: &str) -> ConcordResult<bool>;

    /// Whether `token` is still the current, unexpired lease.
    async fn is_owner(&self, token: &LeaseToken) -> ConcordResult<bool>;

    /// Extend a lease still owned by `token` to `now + ttl`.
    async fn extend(&self, token: &mut LeaseToken, ttl: Duration) -> ConcordResult<()>;
}

#[derive(Debug, Clone)]
struct LeaseRecord {
    lease_id: Uuid,
    holder_id: Uuid,
    expires_at: Timestamp,
}

impl LeaseRecord {
    fn from_token(token: &LeaseToken) -> Self {
        Self {
            lease_id: token.lease_id(),
            holder_id: token.holder_id(),
            expires_at: token.expires_at(),
        }
    }

    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Process-local [`LockManager`] backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: DashMap<String, LeaseRecord>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop lapsed leases. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.leases.len();
        self.leases.retain(|_, lease| !lease.is_expired(now));
        before - self.leases.len()
    }

    /// Number of lease records, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        resource_key: &str,
        holder_id: Uuid,
        ttl: Duration,
    ) -> ConcordResult<LeaseToken> {
        let now = Utc::now();
        match self.leases.entry(resource_key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Err(LockError::Busy {
                        resource: resource_key.to_string(),
                        holder: occupied.get().holder_id,
                    }
                    .into());
                }
                let token = LeaseToken::issue(resource_key, holder_id, ttl);
                occupied.insert(LeaseRecord::from_token(&token));
                trace!(resource = resource_key, %holder_id, "Took over lapsed lease");
                Ok(token)
            }
            Entry::Vacant(vacant) => {
                let token = LeaseToken::issue(resource_key, holder_id, ttl);
                vacant.insert(LeaseRecord::from_token(&token));
                trace!(resource = resource_key, %holder_id, "Acquired lease");
                Ok(token)
            }
        }
    }

    async fn release(&self, token: LeaseToken) -> ConcordResult<bool> {
        let now = Utc::now();
        let removed = self
            .leases
            .remove_if(token.resource_key(), |_, lease| {
                lease.lease_id == token.lease_id() && !lease.is_expired(now)
            })
            .is_some();
        Ok(removed)
    }

    async fn is_held(&self, resource_key: &str) -> ConcordResult<bool> {
        let now = Utc::now();
        Ok(self
            .leases
            .get(resource_key)
            .is_some_and(|lease| !lease.is_expired(now)))
    }

    async fn is_owner(&self, token: &LeaseToken) -> ConcordResult<bool> {
        let now = Utc::now();
        Ok(self
            .leases
            .get(token.resource_key())
            .is_some_and(|lease| lease.lease_id == token.lease_id() && !lease.is_expired(now)))
    }

    async fn extend(&self, token: &mut LeaseToken, ttl: Duration) -> ConcordResult<()> {
        let now = Utc::now();
        let Some(mut lease) = self.leases.get_mut(token.resource_key()) else {
            return Err(not_held(token));
        };
        if lease.lease_id != token.lease_id() || lease.is_expired(now) {
            return Err(not_held(token));
        }
        token.extend(ttl);
        lease.expires_at = token.expires_at();
        Ok(())
    }
}

fn not_held(token: &LeaseToken) -> concord_core::ConcordError {
    LockError::NotHeld {
        resource: token.resource_key().to_string(),
    }
    .into()
}
