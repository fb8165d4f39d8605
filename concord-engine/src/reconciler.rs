//! Reconciler: repairs divergences found by the checker.
//!
//! Each offending key is handled under its own lease:
//!
//! ```text
//! acquire lease ──busy──→ skipped
//!      │
//! re-fetch cache + store, re-classify
//!      │
//!      ├─ consistent / gone ──────→ unchanged
//!      ├─ transient ──────────────→ skipped
//!      ├─ missing ────────────────→ cache ← store
//!      ├─ orphaned ───────────────→ cache entry deleted
//!      └─ stale ── winner = store → cache ← store
//!                └ winner = cache → store ← cache at max(versions) + 1, then cache
//!      │
//! release lease
//! ```
//!
//! Ownership of the lease and the versions the decision was based on are
//! re-checked immediately before every write. A failed store write leaves the
//! cache untouched and is not retried in the same pass.

use crate::locking::acquire_with_retry;
use crate::parts::EngineParts;
use chrono::Utc;
use concord_core::{
    classify, next_store_version, resolve_winner, Classification, ClassifyContext, ConcordError,
    ConcordResult, ConsistencyReport, EntityEnvelope, EntityId, EntityKey, EntityType,
    LeaseToken, ReconcileError, ReconciliationResult, Source,
};
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-key outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Updated {
        cache_writes: u64,
        cache_deletes: u64,
        store_writes: u64,
    },
    Unchanged,
    Skipped,
    Error,
}

impl KeyOutcome {
    fn cache_write() -> Self {
        KeyOutcome::Updated {
            cache_writes: 1,
            cache_deletes: 0,
            store_writes: 0,
        }
    }

    fn cache_delete() -> Self {
        KeyOutcome::Updated {
            cache_writes: 0,
            cache_deletes: 1,
            store_writes: 0,
        }
    }

    fn apply(self, result: &mut ReconciliationResult) {
        match self {
            KeyOutcome::Updated {
                cache_writes,
                cache_deletes,
                store_writes,
            } => {
                result.updated += 1;
                result.cache_writes += cache_writes;
                result.cache_deletes += cache_deletes;
                result.store_writes += store_writes;
            }
            KeyOutcome::Unchanged => result.unchanged += 1,
            KeyOutcome::Skipped => result.skipped += 1,
            KeyOutcome::Error => result.errors += 1,
        }
    }
}

/// Applies the conflict policy to offending keys.
#[derive(Debug, Clone)]
pub struct Reconciler {
    parts: EngineParts,
    holder_id: Uuid,
}

impl Reconciler {
    pub fn new(parts: EngineParts, holder_id: Uuid) -> Self {
        Self { parts, holder_id }
    }

    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }

    /// Reconcile the discrepancies listed in `report`.
    pub async fn reconcile(
        &self,
        report: &ConsistencyReport,
        force: bool,
        batch_size: usize,
        max_instances: usize,
    ) -> ReconciliationResult {
        let ids: Vec<EntityId> = report
            .discrepancies()
            .iter()
            .map(|d| d.entity_id.clone())
            .collect();
        self.reconcile_ids(report.entity_type(), &ids, force, batch_size, max_instances)
            .await
    }

    /// Reconcile explicit keys of `entity_type` in batches.
    ///
    /// Keys inside a batch are processed concurrently; batches run one after
    /// another. At most `max_instances` keys are visited.
    pub async fn reconcile_ids(
        &self,
        entity_type: &EntityType,
        ids: &[EntityId],
        force: bool,
        batch_size: usize,
        max_instances: usize,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();
        let bounded = &ids[..ids.len().min(max_instances)];
        for batch in bounded.chunks(batch_size.max(1)) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|id| self.reconcile_key(entity_type, id, force)),
            )
            .await;
            for outcome in outcomes {
                outcome.apply(&mut result);
            }
        }

        self.parts.stats.record_reconcile(entity_type, &result);
        info!(
            entity_type = %entity_type,
            force,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.errors,
            unchanged = result.unchanged,
            "Reconciliation pass completed"
        );
        result
    }

    async fn reconcile_key(&self, entity_type: &EntityType, entity_id: &EntityId, force: bool) -> KeyOutcome {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let token = match acquire_with_retry(
            self.parts.locks.as_ref(),
            &key,
            self.holder_id,
            &self.parts.config.lock,
        )
        .await
        {
            Ok(token) => token,
            Err(e) if e.is_lock_busy() => {
                debug!(entity = %key, "Lease busy, skipping this pass");
                return KeyOutcome::Skipped;
            }
            Err(e) => {
                warn!(entity = %key, error = %e, "Lease acquisition failed");
                return KeyOutcome::Error;
            }
        };

        let outcome = match self.repair(&key, &token, force).await {
            Ok(outcome) => outcome,
            Err(e) => classify_failure(&key, &e),
        };

        if let Err(e) = self.parts.locks.release(token).await {
            warn!(entity = %key, error = %e, "Lease release failed, it will lapse on its own");
        }
        outcome
    }

    async fn repair(&self, key: &EntityKey, token: &LeaseToken, force: bool) -> ConcordResult<KeyOutcome> {
        let (cached, stored) = self.fetch_pair(key).await?;

        let grace = if force {
            std::time::Duration::ZERO
        } else {
            self.parts.config.orphan_grace_period
        };
        let ctx = ClassifyContext::new(Utc::now(), grace)
            .with_tombstone(self.parts.tombstones.is_tombstoned(key))
            .with_ignored_fields(&self.parts.config.ignored_fields);

        let classification = match classify(cached.as_ref(), stored.as_ref(), &ctx)? {
            None | Some(Classification::Consistent) => return Ok(KeyOutcome::Unchanged),
            Some(Classification::Transient) => return Ok(KeyOutcome::Skipped),
            Some(c) => c,
        };

        match (classification, cached, stored) {
            (Classification::Missing, _, Some(store)) => {
                self.commit_cache_from_store(key, token, store).await
            }
            (Classification::Orphaned, Some(_), None) => {
                self.ensure_owner(key, token).await?;
                self.ensure_store_absent(key).await?;
                self.parts
                    .cache
                    .delete(&key.entity_type, &key.entity_id)
                    .await?;
                debug!(entity = %key, "Deleted orphaned cache entry");
                Ok(KeyOutcome::cache_delete())
            }
            (Classification::Stale { .. }, Some(cache), Some(store)) => {
                match resolve_winner(&cache, &store, force) {
                    Source::Store => self.commit_cache_from_store(key, token, store).await,
                    Source::Cache => self.commit_store_from_cache(key, token, cache, store).await,
                }
            }
            _ => Ok(KeyOutcome::Unchanged),
        }
    }

    async fn fetch_pair(
        &self,
        key: &EntityKey,
    ) -> ConcordResult<(Option<EntityEnvelope>, Option<EntityEnvelope>)> {
        let cached = self.parts.cache.peek(&key.entity_type, &key.entity_id).await?;
        let stored = self
            .parts
            .store
            .get_envelope(&key.entity_type, &key.entity_id)
            .await?;
        Ok((cached, stored))
    }

    async fn ensure_owner(&self, key: &EntityKey, token: &LeaseToken) -> ConcordResult<()> {
        if self.parts.locks.is_owner(token).await? {
            Ok(())
        } else {
            Err(concord_core::LockError::NotHeld {
                resource: key.to_string(),
            }
            .into())
        }
    }

    /// The store version must still be the one the decision was based on.
    async fn ensure_store_version(&self, key: &EntityKey, expected: Option<u64>) -> ConcordResult<()> {
        let found = self
            .parts
            .store
            .get(&key.entity_type, &key.entity_id)
            .await?
            .map(|r| r.version);
        if found != expected {
            return Err(ReconcileError::Conflict {
                entity: key.clone(),
                expected,
                found,
            }
            .into());
        }
        Ok(())
    }

    async fn ensure_store_absent(&self, key: &EntityKey) -> ConcordResult<()> {
        self.ensure_store_version(key, None).await
    }

    async fn commit_cache_from_store(
        &self,
        key: &EntityKey,
        token: &LeaseToken,
        store: EntityEnvelope,
    ) -> ConcordResult<KeyOutcome> {
        self.ensure_owner(key, token).await?;
        self.ensure_store_version(key, store.version).await?;
        let ttl = self.parts.ttl_for(&key.entity_type);
        self.parts.cache.set(store.into_source(Source::Cache), ttl).await?;
        debug!(entity = %key, "Cache repaired from store");
        Ok(KeyOutcome::cache_write())
    }

    async fn commit_store_from_cache(
        &self,
        key: &EntityKey,
        token: &LeaseToken,
        cache: EntityEnvelope,
        store: EntityEnvelope,
    ) -> ConcordResult<KeyOutcome> {
        let version = next_store_version(&cache, &store);

        self.ensure_owner(key, token).await?;
        self.ensure_store_version(key, store.version).await?;
        let current_cache = self
            .parts
            .cache
            .peek(&key.entity_type, &key.entity_id)
            .await?
            .map(|c| c.version);
        if current_cache != Some(cache.version) {
            return Err(ReconcileError::Conflict {
                entity: key.clone(),
                expected: cache.version,
                found: current_cache.flatten(),
            }
            .into());
        }

        if let Err(e) = self
            .parts
            .store
            .put(&key.entity_type, &key.entity_id, cache.payload.clone(), version)
            .await
        {
            error!(entity = %key, version, error = %e, "Store write failed, cache left untouched");
            return Ok(KeyOutcome::Error);
        }

        // Keep the cache on the version the store now holds so the pair
        // compares equal on the next pass.
        let ttl = self.parts.ttl_for(&key.entity_type);
        let refreshed = cache.with_version(version).with_last_updated(Utc::now());
        let cache_writes = match self.parts.cache.set(refreshed, ttl).await {
            Ok(()) => 1,
            Err(e) => {
                warn!(entity = %key, error = %e, "Cache refresh after store repair failed");
                0
            }
        };
        debug!(entity = %key, version, "Store repaired from cache");
        Ok(KeyOutcome::Updated {
            cache_writes,
            cache_deletes: 0,
            store_writes: 1,
        })
    }
}

/// Map a repair failure to skipped or error, logging either way.
fn classify_failure(key: &EntityKey, e: &ConcordError) -> KeyOutcome {
    match e {
        ConcordError::Backend(_) if e.is_store_unavailable() || e.is_cache_unavailable() => {
            warn!(entity = %key, error = %e, "Backend unavailable, skipping this pass");
            KeyOutcome::Skipped
        }
        ConcordError::Lock(_) => {
            warn!(entity = %key, error = %e, "Lease lost before commit, skipping");
            KeyOutcome::Skipped
        }
        ConcordError::Reconcile(_) => {
            warn!(entity = %key, error = %e, "Concurrent write detected, left for the next pass");
            KeyOutcome::Error
        }
        _ => {
            error!(entity = %key, error = %e, "Reconciliation failed");
            KeyOutcome::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_apply() {
        let mut result = ReconciliationResult::default();
        KeyOutcome::cache_write().apply(&mut result);
        KeyOutcome::cache_delete().apply(&mut result);
        KeyOutcome::Unchanged.apply(&mut result);
        KeyOutcome::Skipped.apply(&mut result);
        KeyOutcome::Error.apply(&mut result);
        assert_eq!(result.updated, 2);
        assert_eq!(result.cache_writes, 1);
        assert_eq!(result.cache_deletes, 1);
        assert_eq!(result.unchanged, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors, 1);
        assert_eq!(result.total_writes(), 2);
    }

    #[test]
    fn test_failure_mapping() {
        let key = EntityKey::new("user", "1");
        assert_eq!(
            classify_failure(&key, &ConcordError::store_unavailable("down")),
            KeyOutcome::Skipped
        );
        assert_eq!(
            classify_failure(
                &key,
                &ReconcileError::Conflict {
                    entity: key.clone(),
                    expected: Some(1),
                    found: Some(2),
                }
                .into()
            ),
            KeyOutcome::Error
        );
        assert_eq!(
            classify_failure(&key, &ConcordError::invalid_envelope(key.clone(), "bad")),
            KeyOutcome::Error
        );
    }
}
