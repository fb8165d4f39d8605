//! The engine facade.
//!
//! [`ConsistencyEngine`] wires the cache, store, lock manager, tombstones and
//! stats collector together once, at construction, and exposes the
//! operational surface: checks, reconciliation, stats and the writer path.

use crate::checker::{CheckOptions, ConsistencyChecker};
use crate::parts::EngineParts;
use crate::reconciler::Reconciler;
use crate::writer::WriterPath;
use concord_core::{
    CheckMode, ConcordResult, ConfigError, ConsistencyReport, EngineConfig, EntityEnvelope,
    EntityId, EntityType, InMemoryStatsCollector, Payload, ReconciliationResult, StatsCollector,
};
use concord_storage::{
    CacheBackend, InMemoryCacheBackend, InMemoryLockManager, LockManager, StoreAccessor,
    TombstoneRegistry,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Snapshot returned by [`ConsistencyEngine::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub hit_rate: f64,
    pub miss_rate: f64,
    /// Estimated cache memory in bytes.
    pub memory_estimate: u64,
    pub entry_count: u64,
    pub evictions: u64,
    /// Rolling consistency ratio per entity type.
    pub consistency_ratios: BTreeMap<String, f64>,
}

/// Result of a sampled check, with the reconciliation it triggered, if any.
#[derive(Debug, Clone)]
pub struct SampledOutcome {
    pub report: ConsistencyReport,
    pub reconciliation: Option<ReconciliationResult>,
}

struct EngineInner {
    parts: EngineParts,
    holder_id: Uuid,
    checker: ConsistencyChecker,
    reconciler: Reconciler,
    writer: WriterPath,
    entity_types: RwLock<Vec<EntityType>>,
}

/// Cache/store consistency engine.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ConsistencyEngine {
    inner: Arc<EngineInner>,
}

impl ConsistencyEngine {
    pub fn builder(config: EngineConfig) -> ConsistencyEngineBuilder {
        ConsistencyEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.parts.config
    }

    /// Identity used for every lease this engine takes.
    pub fn holder_id(&self) -> Uuid {
        self.inner.holder_id
    }

    pub fn parts(&self) -> &EngineParts {
        &self.inner.parts
    }

    pub fn checker(&self) -> &ConsistencyChecker {
        &self.inner.checker
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn writer(&self) -> &WriterPath {
        &self.inner.writer
    }

    // ------------------------------------------------------------------
    // Entity type registry
    // ------------------------------------------------------------------

    /// Register `entity_type` for sampling and scheduled sweeps.
    ///
    /// Returns false if it was already registered.
    pub fn register_entity_type(&self, entity_type: EntityType) -> bool {
        let Ok(mut types) = self.inner.entity_types.write() else {
            return false;
        };
        if types.contains(&entity_type) {
            return false;
        }
        types.push(entity_type);
        true
    }

    /// Registered entity types, in registration order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.inner
            .entity_types
            .read()
            .map(|types| types.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Operational surface
    // ------------------------------------------------------------------

    /// Compare `sample_size` random entities of `entity_type`.
    pub async fn run_check(
        &self,
        entity_type: &EntityType,
        sample_size: usize,
    ) -> ConcordResult<ConsistencyReport> {
        self.inner
            .checker
            .check(entity_type, sample_size, CheckMode::RandomSample)
            .await
    }

    /// Sweep `entity_type` and repair every discrepancy found.
    ///
    /// The sweep lists and scans in pages of `batch_size` and each of its
    /// phases probes at most `max_instances` entities.
    ///
    /// With `force`, orphans inside the grace period are repaired too and the
    /// store wins every stale pair.
    pub async fn run_reconcile(
        &self,
        entity_type: &EntityType,
        force: bool,
        batch_size: usize,
        max_instances: usize,
    ) -> ConcordResult<ReconciliationResult> {
        let mut options = CheckOptions::full_sweep(self.config())
            .with_batch_size(batch_size)
            .with_max_instances(max_instances)
            .with_max_discrepancies(max_instances);
        if force {
            options = options.with_orphan_grace(Duration::ZERO);
        }
        let report = self.inner.checker.check_with(entity_type, &options).await?;
        if !report.has_discrepancies() {
            return Ok(ReconciliationResult::default());
        }
        Ok(self
            .inner
            .reconciler
            .reconcile(&report, force, batch_size, max_instances)
            .await)
    }

    /// Random-sample check that reconciles when the ratio drops below
    /// `auto_reconcile_threshold`.
    pub async fn sampled_check(
        &self,
        entity_type: &EntityType,
        sample_size: usize,
    ) -> ConcordResult<SampledOutcome> {
        let config = self.config();
        let report = self.run_check(entity_type, sample_size).await?;
        let ratio = report.consistency_ratio();

        if !report.is_healthy(config.consistency_threshold) {
            warn!(
                entity_type = %entity_type,
                ratio,
                threshold = config.consistency_threshold,
                "Consistency ratio below threshold"
            );
        }

        let reconciliation = if ratio < config.auto_reconcile_threshold && report.has_discrepancies() {
            info!(entity_type = %entity_type, ratio, "Auto-reconciling sampled discrepancies");
            Some(
                self.inner
                    .reconciler
                    .reconcile(
                        &report,
                        false,
                        config.reconcile.batch_size,
                        config.reconcile.max_instances,
                    )
                    .await,
            )
        } else {
            None
        };
        Ok(SampledOutcome {
            report,
            reconciliation,
        })
    }

    /// Cache counters plus per-type consistency ratios.
    pub async fn get_stats(&self) -> ConcordResult<EngineStats> {
        let cache = self.inner.parts.cache.stats().await?;
        Ok(EngineStats {
            hit_rate: cache.hit_rate(),
            miss_rate: cache.miss_rate(),
            memory_estimate: cache.memory_bytes,
            entry_count: cache.entry_count,
            evictions: cache.evictions,
            consistency_ratios: self.inner.parts.stats.consistency_ratios(),
        })
    }

    /// Drop expired tombstones. Returns how many were removed.
    pub fn purge_tombstones(&self) -> usize {
        self.inner.parts.tombstones.purge_expired()
    }

    // ------------------------------------------------------------------
    // Writer path
    // ------------------------------------------------------------------

    pub async fn read(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        self.inner.writer.read(entity_type, entity_id).await
    }

    /// Write through the engine; registers `entity_type` as a side effect.
    pub async fn write(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
    ) -> ConcordResult<EntityEnvelope> {
        self.register_entity_type(entity_type.clone());
        self.inner.writer.write(entity_type, entity_id, payload).await
    }

    pub async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        self.inner.writer.delete(entity_type, entity_id).await
    }
}

impl std::fmt::Debug for ConsistencyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyEngine")
            .field("holder_id", &self.inner.holder_id)
            .field("entity_types", &self.entity_types())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`ConsistencyEngine`].
///
/// A cache and a store are required. The lock manager defaults to
/// [`InMemoryLockManager`] and the stats collector to
/// [`InMemoryStatsCollector`].
pub struct ConsistencyEngineBuilder {
    config: EngineConfig,
    cache: Option<Arc<dyn CacheBackend>>,
    store: Option<Arc<dyn StoreAccessor>>,
    locks: Option<Arc<dyn LockManager>>,
    stats: Option<Arc<dyn StatsCollector>>,
    holder_id: Option<Uuid>,
    entity_types: Vec<EntityType>,
}

impl ConsistencyEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cache: None,
            store: None,
            locks: None,
            stats: None,
            holder_id: None,
            entity_types: Vec::new(),
        }
    }

    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use an [`InMemoryCacheBackend`] built from the eviction config.
    pub fn in_memory_cache(mut self) -> Self {
        self.cache = Some(Arc::new(InMemoryCacheBackend::new(self.config.eviction.clone())));
        self
    }

    pub fn store(mut self, store: Arc<dyn StoreAccessor>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn holder_id(mut self, holder_id: Uuid) -> Self {
        self.holder_id = Some(holder_id);
        self
    }

    pub fn entity_type(mut self, entity_type: impl Into<EntityType>) -> Self {
        self.entity_types.push(entity_type.into());
        self
    }

    pub fn entity_types<I, T>(mut self, entity_types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EntityType>,
    {
        self.entity_types
            .extend(entity_types.into_iter().map(Into::into));
        self
    }

    /// Validate the config and assemble the engine.
    pub fn build(self) -> ConcordResult<ConsistencyEngine> {
        self.config.validate()?;
        let cache = self.cache.ok_or_else(|| ConfigError::MissingRequired {
            field: "cache".to_string(),
        })?;
        let store = self.store.ok_or_else(|| ConfigError::MissingRequired {
            field: "store".to_string(),
        })?;
        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(InMemoryLockManager::new()));
        let stats = self
            .stats
            .unwrap_or_else(|| Arc::new(InMemoryStatsCollector::default()));
        let holder_id = self.holder_id.unwrap_or_else(Uuid::now_v7);

        let parts = EngineParts {
            cache,
            store,
            locks,
            tombstones: Arc::new(TombstoneRegistry::new(self.config.tombstone_ttl)),
            stats,
            config: Arc::new(self.config),
        };

        let mut entity_types: Vec<EntityType> = Vec::with_capacity(self.entity_types.len());
        for entity_type in self.entity_types {
            if !entity_type.is_valid() {
                return Err(ConfigError::InvalidValue {
                    field: "entity_types".to_string(),
                    value: entity_type.to_string(),
                    reason: "entity type names must be non-empty and must not contain ':'"
                        .to_string(),
                }
                .into());
            }
            if !entity_types.contains(&entity_type) {
                entity_types.push(entity_type);
            }
        }

        info!(
            holder_id = %holder_id,
            entity_types = entity_types.len(),
            eviction = %parts.config.eviction.policy,
            check_probability = parts.config.check_probability,
            "Consistency engine initialized"
        );

        Ok(ConsistencyEngine {
            inner: Arc::new(EngineInner {
                checker: ConsistencyChecker::new(parts.clone()),
                reconciler: Reconciler::new(parts.clone(), holder_id),
                writer: WriterPath::new(parts.clone(), holder_id),
                parts,
                holder_id,
                entity_types: RwLock::new(entity_types),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{ConcordError, EntityEnvelope, Source};
    use concord_storage::InMemoryStore;
    use serde_json::json;

    fn engine_with(store: Arc<InMemoryStore>) -> ConsistencyEngine {
        ConsistencyEngine::builder(EngineConfig::default())
            .in_memory_cache()
            .store(store)
            .entity_type("user")
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_cache_and_store() {
        let err = ConsistencyEngine::builder(EngineConfig::default())
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Config(ConfigError::MissingRequired { ref field }) if field == "cache"
        ));

        let err = ConsistencyEngine::builder(EngineConfig::default())
            .in_memory_cache()
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConcordError::Config(ConfigError::MissingRequired { ref field }) if field == "store"
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig::default().with_check_probability(1.5);
        let result = ConsistencyEngine::builder(config)
            .in_memory_cache()
            .store(Arc::new(InMemoryStore::new()))
            .build();
        assert!(matches!(result, Err(ConcordError::Config(_))));
    }

    #[test]
    fn test_register_entity_type_dedupes() {
        let engine = engine_with(Arc::new(InMemoryStore::new()));
        assert!(!engine.register_entity_type(EntityType::new("user")));
        assert!(engine.register_entity_type(EntityType::new("order")));
        assert_eq!(
            engine.entity_types(),
            vec![EntityType::new("user"), EntityType::new("order")]
        );
    }

    #[tokio::test]
    async fn test_write_then_read_hits_cache() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store.clone());
        let ty = EntityType::new("user");
        let id = EntityId::new("1");

        let written = engine
            .write(&ty, &id, Payload::Structured(json!({"name": "ada"})))
            .await
            .unwrap();
        assert_eq!(written.version, Some(1));

        let read = engine.read(&ty, &id).await.unwrap().unwrap();
        assert_eq!(read.source, Source::Cache);
        assert_eq!(read.version, Some(1));

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.entry_count, 1);
        assert!(stats.hit_rate > 0.0);
    }

    #[tokio::test]
    async fn test_run_reconcile_populates_missing_entries() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store.clone());
        let ty = EntityType::new("user");
        for i in 0..5u64 {
            store
                .put(&ty, &EntityId::from(i), Payload::Opaque(vec![i as u8]), 1)
                .await
                .unwrap();
        }

        let result = engine.run_reconcile(&ty, false, 2, 100).await.unwrap();
        assert_eq!(result.updated, 5);
        assert_eq!(result.cache_writes, 5);

        let cached: Option<EntityEnvelope> = engine.parts().cache.get(&ty, &EntityId::from(3u64)).await.unwrap();
        assert_eq!(cached.unwrap().payload, Payload::Opaque(vec![3]));

        let again = engine.run_reconcile(&ty, false, 2, 100).await.unwrap();
        assert_eq!(again.total_writes(), 0);
    }
}
