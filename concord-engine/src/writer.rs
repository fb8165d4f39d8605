//! Writer path: application reads and writes through the cache.
//!
//! The store is written first and is the source of truth. Cache failures
//! degrade to store-only operation instead of failing the caller; the
//! reconciler repairs whatever divergence that leaves behind.

use crate::locking::acquire_with_retry;
use crate::parts::EngineParts;
use concord_core::{
    ConcordResult, EntityEnvelope, EntityId, EntityKey, EntityType, LeaseToken, Payload, Source,
};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WriterPath {
    parts: EngineParts,
    holder_id: Uuid,
}

impl WriterPath {
    pub fn new(parts: EngineParts, holder_id: Uuid) -> Self {
        Self { parts, holder_id }
    }

    /// Read through the cache, populating it from the store on a miss.
    pub async fn read(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        match self.parts.cache.get(entity_type, entity_id).await {
            Ok(Some(hit)) => return Ok(Some(hit)),
            Ok(None) => {}
            Err(e) if e.is_cache_unavailable() => {
                warn!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    error = %e,
                    "Cache unavailable, reading from store"
                );
                return self.parts.store.get_envelope(entity_type, entity_id).await;
            }
            Err(e) => return Err(e),
        }

        let Some(stored) = self.parts.store.get_envelope(entity_type, entity_id).await? else {
            return Ok(None);
        };
        let ttl = self.parts.ttl_for(entity_type);
        if let Err(e) = self
            .parts
            .cache
            .set(stored.clone().into_source(Source::Cache), ttl)
            .await
        {
            warn!(entity_type = %entity_type, entity_id = %entity_id, error = %e, "Cache populate failed");
        }
        Ok(Some(stored))
    }

    /// Write `payload` under the entity lease.
    ///
    /// The store receives `current version + 1`; the cache then receives the
    /// same envelope. Returns the envelope as written to the store.
    pub async fn write(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
    ) -> ConcordResult<EntityEnvelope> {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let token = self.lease(&key).await?;
        let result = self.write_locked(&key, payload).await;
        self.release(&key, token).await;
        result
    }

    async fn write_locked(&self, key: &EntityKey, payload: Payload) -> ConcordResult<EntityEnvelope> {
        let current = self
            .parts
            .store
            .get(&key.entity_type, &key.entity_id)
            .await?
            .map(|r| r.version)
            .unwrap_or(0);
        let version = current + 1;
        self.parts
            .store
            .put(&key.entity_type, &key.entity_id, payload.clone(), version)
            .await?;
        self.parts.tombstones.clear(key);

        let envelope = EntityEnvelope::new(
            key.entity_type.clone(),
            key.entity_id.clone(),
            payload,
            Source::Store,
        )
        .with_version(version);

        let ttl = self.parts.ttl_for(&key.entity_type);
        if let Err(e) = self
            .parts
            .cache
            .set(envelope.clone().into_source(Source::Cache), ttl)
            .await
        {
            warn!(entity = %key, error = %e, "Cache write failed, continuing store-only");
        }
        debug!(entity = %key, version, "Entity written");
        Ok(envelope)
    }

    /// Delete from the store, leave a tombstone, then drop the cache entry.
    ///
    /// Returns whether the store held the entity.
    pub async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let token = self.lease(&key).await?;
        let result = self.delete_locked(&key).await;
        self.release(&key, token).await;
        result
    }

    async fn delete_locked(&self, key: &EntityKey) -> ConcordResult<bool> {
        let existed = self
            .parts
            .store
            .delete(&key.entity_type, &key.entity_id)
            .await?;
        self.parts.tombstones.record(key.clone());
        if let Err(e) = self.parts.cache.delete(&key.entity_type, &key.entity_id).await {
            warn!(entity = %key, error = %e, "Cache delete failed, entry left as tombstoned orphan");
        }
        debug!(entity = %key, existed, "Entity deleted");
        Ok(existed)
    }

    async fn lease(&self, key: &EntityKey) -> ConcordResult<LeaseToken> {
        acquire_with_retry(
            self.parts.locks.as_ref(),
            key,
            self.holder_id,
            &self.parts.config.lock,
        )
        .await
    }

    async fn release(&self, key: &EntityKey, token: LeaseToken) {
        if let Err(e) = self.parts.locks.release(token).await {
            warn!(entity = %key, error = %e, "Lease release failed, it will lapse on its own");
        }
    }
}
