//! Lease token handed out by a lock manager.
//!
//! ```text
//! (free) ─── acquire() ──→ LeaseToken ─── release(token) ──→ (free)
//!                              │
//!                         extend() ↺      expires_at passes ──→ (free)
//! ```
//!
//! The token is not `Clone`: releasing consumes it, so a holder cannot
//! release the same lease twice.

use crate::{EntityKey, Timestamp};
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

/// Prefix of every lease resource key.
pub const LOCK_KEY_PREFIX: &str = "concord:lock";

/// Resource key used to lease one entity.
pub fn entity_resource_key(key: &EntityKey) -> String {
    format!("{}:{}", LOCK_KEY_PREFIX, key)
}

/// Exclusive, time-limited claim on a resource.
#[derive(Debug, PartialEq, Eq)]
pub struct LeaseToken {
    lease_id: Uuid,
    resource_key: String,
    holder_id: Uuid,
    acquired_at: Timestamp,
    expires_at: Timestamp,
}

impl LeaseToken {
    /// Issue a lease starting now. A TTL beyond chrono's range is clamped to
    /// one day.
    pub fn issue(resource_key: impl Into<String>, holder_id: Uuid, ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        Self {
            lease_id: Uuid::now_v7(),
            resource_key: resource_key.into(),
            holder_id,
            acquired_at,
            expires_at: acquired_at + chrono_ttl(ttl),
        }
    }

    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Check if the lease has lapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left before the lease lapses, `None` once expired.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Push the expiry to `now + ttl`. Only meaningful while the lock manager
    /// still records this lease.
    pub fn extend(&mut self, ttl: Duration) {
        self.expires_at = Utc::now() + chrono_ttl(ttl);
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_sets_expiry() {
        let token = LeaseToken::issue("r", Uuid::now_v7(), Duration::from_secs(10));
        assert_eq!(token.resource_key(), "r");
        assert!(!token.is_expired(token.acquired_at()));
        assert!(token.is_expired(token.expires_at()));
        assert_eq!(
            token.remaining(token.acquired_at()),
            Some(Duration::from_secs(10))
        );
        assert_eq!(token.remaining(token.expires_at()), None);
    }

    #[test]
    fn test_extend_moves_expiry_forward() {
        let mut token = LeaseToken::issue("r", Uuid::now_v7(), Duration::from_millis(1));
        let before = token.expires_at();
        token.extend(Duration::from_secs(60));
        assert!(token.expires_at() > before);
    }

    #[test]
    fn test_entity_resource_key() {
        let key = EntityKey::new("user", "9");
        assert_eq!(entity_resource_key(&key), "concord:lock:user:9");
    }

    #[test]
    fn test_lease_ids_unique() {
        let holder = Uuid::now_v7();
        let a = LeaseToken::issue("r", holder, Duration::from_secs(1));
        let b = LeaseToken::issue("r", holder, Duration::from_secs(1));
        assert_ne!(a.lease_id(), b.lease_id());
        assert_eq!(a.holder_id(), b.holder_id());
    }
}
