//! Concord Test Utilities
//!
//! Shared test infrastructure for the Concord workspace:
//! - Fault-injecting cache and store wrappers
//! - A stats collector that records every call
//! - Proptest generators for envelopes and identities
//! - Fixtures for seeding cache/store pairs
//! - Assertions over cache/store agreement

pub use concord_core::{
    ConcordError, ConcordResult, ConsistencyReport, EngineConfig, EntityEnvelope, EntityId,
    EntityKey, EntityType, EvictionConfig, EvictionPolicy, InMemoryStatsCollector, Payload,
    ReconciliationResult, Source, StatsCollector, Timestamp,
};
pub use concord_storage::{
    CacheBackend, CacheStats, InMemoryCacheBackend, InMemoryStore, ScanPage, StoreAccessor,
    StoreRecord,
};

use async_trait::async_trait;
use concord_core::BackendError;
use concord_storage::IdPage;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Cache wrapper that can be switched into `CacheUnavailable`.
///
/// While down, every call fails. Successful `set`/`delete` calls are counted
/// so tests can assert on write volume.
#[derive(Debug)]
pub struct FlakyCache {
    inner: Arc<InMemoryCacheBackend>,
    down: AtomicBool,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl FlakyCache {
    pub fn new(inner: Arc<InMemoryCacheBackend>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Wrap a fresh in-memory cache with default eviction settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCacheBackend::new(EvictionConfig::default())))
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryCacheBackend {
        &self.inner
    }

    pub fn set_count(&self) -> u64 {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check(&self) -> ConcordResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(ConcordError::cache_unavailable("injected cache outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for FlakyCache {
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        self.check()?;
        self.inner.get(entity_type, entity_id).await
    }

    async fn peek(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        self.check()?;
        self.inner.peek(entity_type, entity_id).await
    }

    async fn set(&self, envelope: EntityEnvelope, ttl: Option<Duration>) -> ConcordResult<()> {
        self.check()?;
        self.inner.set(envelope, ttl).await?;
        self.sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        self.check()?;
        let removed = self.inner.delete(entity_type, entity_id).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(removed)
    }

    async fn scan_page(
        &self,
        entity_type: &EntityType,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> ConcordResult<ScanPage> {
        self.check()?;
        self.inner.scan_page(entity_type, pattern, cursor, count).await
    }

    async fn ping(&self) -> ConcordResult<()> {
        self.check()?;
        self.inner.ping().await
    }

    async fn stats(&self) -> ConcordResult<CacheStats> {
        self.check()?;
        self.inner.stats().await
    }
}

/// Store wrapper with injectable outages and write rejections.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: Arc<InMemoryStore>,
    down: AtomicBool,
    reject_puts: AtomicBool,
    failing_ids: Mutex<HashSet<EntityId>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Fail every call with `StoreUnavailable`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Refuse every `put` with `StoreRejected`.
    pub fn set_reject_puts(&self, reject: bool) {
        self.reject_puts.store(reject, Ordering::SeqCst);
    }

    /// Fail point reads of one id with `StoreUnavailable`.
    pub fn fail_reads_of(&self, entity_id: impl Into<EntityId>) {
        if let Ok(mut ids) = self.failing_ids.lock() {
            ids.insert(entity_id.into());
        }
    }

    fn check(&self) -> ConcordResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(ConcordError::store_unavailable("injected store outage"))
        } else {
            Ok(())
        }
    }

    fn read_fails(&self, entity_id: &EntityId) -> bool {
        self.failing_ids
            .lock()
            .map(|ids| ids.contains(entity_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StoreAccessor for FaultyStore {
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<StoreRecord>> {
        self.check()?;
        if self.read_fails(entity_id) {
            return Err(ConcordError::store_unavailable(format!(
                "injected read failure for {}",
                entity_id
            )));
        }
        self.inner.get(entity_type, entity_id).await
    }

    async fn put(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        payload: Payload,
        version: u64,
    ) -> ConcordResult<()> {
        self.check()?;
        if self.reject_puts.load(Ordering::SeqCst) {
            return Err(BackendError::StoreRejected {
                entity: EntityKey::new(entity_type.clone(), entity_id.clone()),
                reason: "injected constraint violation".to_string(),
            }
            .into());
        }
        self.inner.put(entity_type, entity_id, payload, version).await
    }

    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        self.check()?;
        self.inner.delete(entity_type, entity_id).await
    }

    async fn list_ids(
        &self,
        entity_type: &EntityType,
        since_cursor: Option<&EntityId>,
        limit: usize,
    ) -> ConcordResult<IdPage> {
        self.check()?;
        self.inner.list_ids(entity_type, since_cursor, limit).await
    }
}

// ============================================================================
// RECORDING STATS COLLECTOR
// ============================================================================

/// Stats collector that keeps every report and reconciliation it receives.
///
/// Ratios are delegated to an [`InMemoryStatsCollector`].
#[derive(Debug, Default)]
pub struct RecordingStatsCollector {
    rolling: InMemoryStatsCollector,
    checks: Mutex<Vec<ConsistencyReport>>,
    reconciles: Mutex<Vec<(EntityType, ReconciliationResult)>>,
}

impl RecordingStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checks(&self) -> Vec<ConsistencyReport> {
        self.checks.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn reconciles(&self) -> Vec<(EntityType, ReconciliationResult)> {
        self.reconciles.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn check_count(&self) -> usize {
        self.checks.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl StatsCollector for RecordingStatsCollector {
    fn record_check(&self, report: &ConsistencyReport) {
        self.rolling.record_check(report);
        if let Ok(mut checks) = self.checks.lock() {
            checks.push(report.clone());
        }
    }

    fn record_reconcile(&self, entity_type: &EntityType, result: &ReconciliationResult) {
        self.rolling.record_reconcile(entity_type, result);
        if let Ok(mut reconciles) = self.reconciles.lock() {
            reconciles.push((entity_type.clone(), result.clone()));
        }
    }

    fn consistency_ratio(&self, entity_type: &EntityType) -> Option<f64> {
        self.rolling.consistency_ratio(entity_type)
    }

    fn consistency_ratios(&self) -> BTreeMap<String, f64> {
        self.rolling.consistency_ratios()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop_oneof![
            Just(EntityType::new("user")),
            Just(EntityType::new("order")),
            Just(EntityType::new("product")),
            "[a-z]{1,12}".prop_map(EntityType::new),
        ]
    }

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        "[a-z0-9-]{1,16}".prop_map(EntityId::new)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-01-01 .. 2030-01-01
        (1_577_836_800i64..1_893_456_000i64)
            .prop_map(|secs| Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn arb_payload() -> impl Strategy<Value = Payload> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Payload::Opaque),
            ("[a-z]{1,8}", any::<i64>(), any::<bool>()).prop_map(|(name, n, flag)| {
                Payload::Structured(serde_json::json!({ "name": name, "n": n, "flag": flag }))
            }),
        ]
    }

    pub fn arb_version() -> impl Strategy<Value = Option<u64>> {
        prop::option::weighted(0.8, 1u64..1_000)
    }

    /// Envelope for a fixed key, with arbitrary payload, version and time.
    pub fn arb_envelope_for(
        entity_type: EntityType,
        entity_id: EntityId,
        source: Source,
    ) -> impl Strategy<Value = EntityEnvelope> {
        (arb_payload(), arb_version(), arb_timestamp()).prop_map(move |(payload, version, ts)| {
            let envelope =
                EntityEnvelope::new(entity_type.clone(), entity_id.clone(), payload, source)
                    .with_last_updated(ts);
            match version {
                Some(v) => envelope.with_version(v),
                None => envelope,
            }
        })
    }

    pub fn arb_envelope(source: Source) -> impl Strategy<Value = EntityEnvelope> {
        (arb_entity_type(), arb_entity_id())
            .prop_flat_map(move |(ty, id)| arb_envelope_for(ty, id, source))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    pub const USER: &str = "user";

    pub fn user() -> EntityType {
        EntityType::new(USER)
    }

    pub fn text(s: &str) -> Payload {
        Payload::Opaque(s.as_bytes().to_vec())
    }

    /// Cache-side envelope with explicit version and timestamp.
    pub fn cache_envelope(
        entity_type: &EntityType,
        entity_id: impl Into<EntityId>,
        payload: Payload,
        version: u64,
        last_updated: Timestamp,
    ) -> EntityEnvelope {
        EntityEnvelope::new(entity_type.clone(), entity_id, payload, Source::Cache)
            .with_version(version)
            .with_last_updated(last_updated)
    }

    /// Seed the store directly, bypassing version checks.
    pub fn seed_store(
        store: &InMemoryStore,
        entity_type: &EntityType,
        entity_id: impl Into<EntityId>,
        payload: Payload,
        version: u64,
        last_updated: Timestamp,
    ) {
        store.insert_record(
            EntityKey::new(entity_type.clone(), entity_id.into()),
            StoreRecord {
                payload,
                version,
                last_updated,
            },
        );
    }

    /// Seed the cache with no TTL.
    pub async fn seed_cache(cache: &dyn CacheBackend, envelope: EntityEnvelope) -> ConcordResult<()> {
        cache.set(envelope, None).await
    }

    /// Config for tests: every request samples, no per-type throttle, no
    /// orphan grace, short lease backoff.
    pub fn eager_config() -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_check_probability(1.0)
            .with_orphan_grace_period(Duration::from_millis(1));
        config.check_interval_per_type = Duration::from_millis(1);
        config.lock.acquire_attempts = 1;
        config.lock.acquire_backoff = Duration::from_millis(1);
        config
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert that the cache holds the store's payload and version for `id`.
    pub async fn assert_cache_matches_store(
        cache: &dyn CacheBackend,
        store: &dyn StoreAccessor,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) {
        let cached = cache
            .get(entity_type, entity_id)
            .await
            .expect("cache get failed")
            .unwrap_or_else(|| panic!("{}:{} missing from cache", entity_type, entity_id));
        let stored = store
            .get(entity_type, entity_id)
            .await
            .expect("store get failed")
            .unwrap_or_else(|| panic!("{}:{} missing from store", entity_type, entity_id));
        assert_eq!(cached.payload, stored.payload, "payload mismatch for {}", entity_id);
        assert_eq!(cached.version, Some(stored.version), "version mismatch for {}", entity_id);
    }

    /// Assert that the cache has no entry for `id`.
    pub async fn assert_not_cached(cache: &dyn CacheBackend, entity_type: &EntityType, entity_id: &EntityId) {
        let cached = cache
            .get(entity_type, entity_id)
            .await
            .expect("cache get failed");
        assert!(cached.is_none(), "{}:{} still cached", entity_type, entity_id);
    }
}
