//! Bounded lease acquisition.

use concord_core::lease::entity_resource_key;
use concord_core::{ConcordResult, EntityKey, LeaseToken, LockConfig};
use concord_storage::LockManager;
use tracing::trace;
use uuid::Uuid;

/// Try to lease `key`, retrying `LockBusy` with linear backoff.
///
/// Gives up after `config.acquire_attempts` attempts and returns the last
/// `LockBusy`. Any other error is returned immediately.
pub async fn acquire_with_retry(
    locks: &dyn LockManager,
    key: &EntityKey,
    holder_id: Uuid,
    config: &LockConfig,
) -> ConcordResult<LeaseToken> {
    let resource = entity_resource_key(key);
    let attempts = config.acquire_attempts.max(1);
    let mut attempt = 1;
    loop {
        match locks.acquire(&resource, holder_id, config.lease_ttl).await {
            Ok(token) => return Ok(token),
            Err(e) if e.is_lock_busy() && attempt < attempts => {
                trace!(resource = %resource, attempt, "Lease busy, backing off");
                tokio::time::sleep(config.acquire_backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_storage::InMemoryLockManager;
    use std::time::Duration;

    fn config(attempts: u32) -> LockConfig {
        LockConfig {
            lease_ttl: Duration::from_secs(30),
            acquire_attempts: attempts,
            acquire_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_acquires_free_key() {
        let locks = InMemoryLockManager::new();
        let key = EntityKey::new("user", "1");
        let token = acquire_with_retry(&locks, &key, Uuid::now_v7(), &config(3))
            .await
            .unwrap();
        assert_eq!(token.resource_key(), "concord:lock:user:1");
    }

    #[tokio::test]
    async fn test_gives_up_with_lock_busy() {
        let locks = InMemoryLockManager::new();
        let key = EntityKey::new("user", "1");
        let _held = acquire_with_retry(&locks, &key, Uuid::now_v7(), &config(1))
            .await
            .unwrap();
        let err = acquire_with_retry(&locks, &key, Uuid::now_v7(), &config(3))
            .await
            .unwrap_err();
        assert!(err.is_lock_busy());
    }

    #[tokio::test]
    async fn test_succeeds_once_lease_lapses() {
        let locks = InMemoryLockManager::new();
        let key = EntityKey::new("user", "1");
        let short = LockConfig {
            lease_ttl: Duration::from_millis(5),
            ..config(1)
        };
        let _held = acquire_with_retry(&locks, &key, Uuid::now_v7(), &short)
            .await
            .unwrap();
        let patient = LockConfig {
            acquire_backoff: Duration::from_millis(10),
            ..config(5)
        };
        assert!(acquire_with_retry(&locks, &key, Uuid::now_v7(), &patient)
            .await
            .is_ok());
    }
}
