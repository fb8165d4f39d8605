//! Store accessor contract and an in-memory store.
//!
//! The store is the authoritative side. The engine never assumes it owns
//! the store: it only needs point reads and writes plus a paged id listing
//! for sweeps.

use async_trait::async_trait;
use chrono::Utc;
use concord_core::{
    BackendError, ConcordError, ConcordResult, EntityEnvelope, EntityId, EntityKey, EntityType,
    Payload, Source, Timestamp,
};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Authoritative record as the store returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub payload: Payload,
    pub version: u64,
    pub last_updated: Timestamp,
}

impl StoreRecord {
    pub fn into_envelope(self, entity_type: EntityType, entity_id: EntityId) -> EntityEnvelope {
        EntityEnvelope {
            entity_type,
            entity_id,
            payload: self.payload,
            version: Some(self.version),
            last_updated: self.last_updated,
            source: Source::Store,
        }
    }
}

/// One page of entity ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPage {
    /// Ids in ascending order.
    pub ids: Vec<EntityId>,
    /// Pass as `since_cursor` to continue; `None` when exhausted.
    pub next_cursor: Option<EntityId>,
}

/// Access to the persistent store.
///
/// Transport failures surface as `BackendError::StoreUnavailable`; refused
/// writes as `BackendError::StoreRejected`.
#[async_trait]
pub trait StoreAccessor: Send + Sync {
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<StoreRecord>>;

    /// Write `payload` at `version`.
    async fn put(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
        version: u64,
    ) -> ConcordResult<()>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool>;

    /// Ids of `entity_type` strictly after `since_cursor`, at most `limit`.
    async fn list_ids(
        &self,
        entity_type: &EntityType,
        since_cursor: Option<&EntityId>,
        limit: usize,
    ) -> ConcordResult<IdPage>;

    /// Convenience wrapper returning the record as a store-sourced envelope.
    async fn get_envelope(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        Ok(self
            .get(entity_type, entity_id)
            .await?
            .map(|r| r.into_envelope(entity_type.clone(), entity_id.clone())))
    }
}

/// In-memory [`StoreAccessor`].
///
/// Rejects writes that would move a record's version backwards.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<EntityKey, StoreRecord>>,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> ConcordResult<RwLockReadGuard<'_, BTreeMap<EntityKey, StoreRecord>>> {
        self.records
            .read()
            .map_err(|_| ConcordError::store_unavailable("store lock poisoned"))
    }

    fn write(&self) -> ConcordResult<RwLockWriteGuard<'_, BTreeMap<EntityKey, StoreRecord>>> {
        self.records
            .write()
            .map_err(|_| ConcordError::store_unavailable("store lock poisoned"))
    }

    /// Seed a record verbatim, bypassing version checks and counters.
    pub fn insert_record(&self, key: EntityKey, record: StoreRecord) {
        if let Ok(mut records) = self.records.write() {
            records.insert(key, record);
        }
    }

    /// Current record for `key` without going through the async contract.
    pub fn record(&self, key: &EntityKey) -> Option<StoreRecord> {
        self.records.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `put` calls so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Successful `delete` calls that removed a record.
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StoreAccessor for InMemoryStore {
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<StoreRecord>> {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        Ok(self.read()?.get(&key).cloned())
    }

    async fn put(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
        version: u64,
    ) -> ConcordResult<()> {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let mut records = self.write()?;
        if let Some(current) = records.get(&key) {
            if version < current.version {
                return Err(BackendError::StoreRejected {
                    entity: key,
                    reason: format!(
                        "version {} is older than stored version {}",
                        version, current.version
                    ),
                }
                .into());
            }
        }
        records.insert(
            key,
            StoreRecord {
                payload,
                version,
                last_updated: Utc::now(),
            },
        );
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let removed = self.write()?.remove(&key).is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn list_ids(
        &self,
        entity_type: &EntityType,
        since_cursor: Option<&EntityId>,
        limit: usize,
    ) -> ConcordResult<IdPage> {
        let limit = limit.max(1);
        let start = match since_cursor {
            Some(id) => Bound::Excluded(EntityKey::new(entity_type.clone(), id.clone())),
            None => Bound::Included(EntityKey::new(entity_type.clone(), "")),
        };
        let records = self.read()?;
        let ids: Vec<EntityId> = records
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| &k.entity_type == entity_type)
            .take(limit)
            .map(|(k, _)| k.entity_id.clone())
            .collect();
        let next_cursor = if ids.len() == limit {
            ids.last().cloned()
        } else {
            None
        };
        Ok(IdPage { ids, next_cursor })
    }
}
