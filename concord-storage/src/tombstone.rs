//! Tombstones for intentional deletes.
//!
//! A cache entry whose store record is gone is ambiguous: either the delete
//! was intentional, or the store write that created it has not landed yet.
//! Deletes issued through the writer path leave a tombstone so the checker
//! can tell the two apart without waiting out the orphan grace period.

use chrono::Utc;
use concord_core::{EntityKey, Timestamp};
use dashmap::DashMap;
use std::time::Duration;

/// Remembers recent intentional deletes for a fixed TTL.
#[derive(Debug)]
pub struct TombstoneRegistry {
    ttl: chrono::Duration,
    entries: DashMap<EntityKey, Timestamp>,
}

impl TombstoneRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1)),
            entries: DashMap::new(),
        }
    }

    /// Record that `key` was deleted now.
    pub fn record(&self, key: EntityKey) {
        self.entries.insert(key, Utc::now());
    }

    /// Forget a tombstone, e.g. when the entity is written again.
    pub fn clear(&self, key: &EntityKey) {
        self.entries.remove(key);
    }

    /// When `key` was deleted, if the tombstone is still live.
    pub fn deleted_at(&self, key: &EntityKey) -> Option<Timestamp> {
        let deleted_at = *self.entries.get(key)?;
        if Utc::now() - deleted_at >= self.ttl {
            self.entries.remove(key);
            return None;
        }
        Some(deleted_at)
    }

    pub fn is_tombstoned(&self, key: &EntityKey) -> bool {
        self.deleted_at(key).is_some()
    }

    /// Drop lapsed tombstones. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, deleted_at| now - *deleted_at < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_clear() {
        let registry = TombstoneRegistry::new(Duration::from_secs(60));
        let key = EntityKey::new("user", "1");
        assert!(!registry.is_tombstoned(&key));
        registry.record(key.clone());
        assert!(registry.is_tombstoned(&key));
        registry.clear(&key);
        assert!(!registry.is_tombstoned(&key));
    }

    #[test]
    fn test_tombstones_lapse() {
        let registry = TombstoneRegistry::new(Duration::from_millis(1));
        let key = EntityKey::new("user", "1");
        registry.record(key.clone());
        registry.record(EntityKey::new("user", "2"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!registry.is_tombstoned(&key));
        assert_eq!(registry.purge_expired(), 1);
        assert!(registry.is_empty());
    }
}
