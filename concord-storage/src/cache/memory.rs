//! In-memory cache backend with TTL and capacity-driven eviction.

use super::eviction::{select_victim, EvictionCandidate};
use super::key::{CacheKey, KeyPattern};
use super::traits::{CacheBackend, CacheStats, ScanPage};
use async_trait::async_trait;
use concord_core::{
    ConcordError, ConcordResult, EntityEnvelope, EntityId, EntityType, EvictionConfig, Source,
};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// Fixed bookkeeping cost charged per entry in the memory estimate.
pub const ENTRY_OVERHEAD_BYTES: u64 = 64;

#[derive(Debug, Clone)]
struct CacheEntry {
    envelope: EntityEnvelope,
    expires_at: Option<Instant>,
    last_access: Instant,
    access_ticket: u64,
    insert_seq: u64,
    size: u64,
    /// Position in `CacheState::slots`.
    slot: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl EvictionCandidate for CacheEntry {
    fn access_ticket(&self) -> u64 {
        self.access_ticket
    }

    fn insert_seq(&self) -> u64 {
        self.insert_seq
    }

    fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Dense key list for O(1) random selection.
    slots: Vec<CacheKey>,
    /// Ordered key index for scans.
    ordered: BTreeSet<CacheKey>,
    memory_bytes: u64,
    next_ticket: u64,
    next_seq: u64,
}

impl CacheState {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.slots.swap_remove(entry.slot);
        if let Some(moved) = self.slots.get(entry.slot) {
            if let Some(moved_entry) = self.entries.get_mut(moved) {
                moved_entry.slot = entry.slot;
            }
        }
        self.ordered.remove(key);
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn insert(&mut self, key: CacheKey, mut entry: CacheEntry) -> Option<CacheEntry> {
        let previous = self.remove(&key);
        entry.slot = self.slots.len();
        self.slots.push(key.clone());
        self.ordered.insert(key.clone());
        self.memory_bytes += entry.size;
        self.entries.insert(key, entry);
        previous
    }
}

/// In-process [`CacheBackend`].
///
/// Bookkeeping for a key (access ticket, memory accounting) is updated under
/// the same lock as the value itself. Eviction runs inside `set`.
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    config: EvictionConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new(EvictionConfig::default())
    }
}

impl InMemoryCacheBackend {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    fn lock(&self) -> ConcordResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| ConcordError::cache_unavailable("cache state lock poisoned"))
    }

    /// Number of live entries, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is present without touching its access metadata.
    pub fn contains(&self, entity_type: &EntityType, entity_id: &EntityId) -> bool {
        let key = CacheKey::new(entity_type.clone(), entity_id.clone());
        self.lock()
            .map(|s| s.entries.get(&key).is_some_and(|e| !e.is_expired(Instant::now())))
            .unwrap_or(false)
    }

    /// Last access time recorded for a key.
    pub fn last_access(&self, entity_type: &EntityType, entity_id: &EntityId) -> Option<Instant> {
        let key = CacheKey::new(entity_type.clone(), entity_id.clone());
        self.lock().ok()?.entries.get(&key).map(|e| e.last_access)
    }

    fn get_sync(&self, key: &CacheKey) -> ConcordResult<Option<EntityEnvelope>> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let expired = match state.entries.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            state.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let ticket = state.ticket();
        let envelope = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.access_ticket = ticket;
                entry.last_access = now;
                entry.envelope.clone()
            }
            None => return Ok(None),
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(envelope))
    }

    /// Expired entries read as absent but are left for `get` or eviction to
    /// purge.
    fn peek_sync(&self, key: &CacheKey) -> ConcordResult<Option<EntityEnvelope>> {
        let now = Instant::now();
        let state = self.lock()?;
        Ok(state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.envelope.clone()))
    }

    fn set_sync(&self, envelope: EntityEnvelope, ttl: Option<Duration>) -> ConcordResult<()> {
        let now = Instant::now();
        let key = CacheKey::new(envelope.entity_type.clone(), envelope.entity_id.clone());
        let size = key.encode().len() as u64 + envelope.payload.size_bytes() as u64
            + ENTRY_OVERHEAD_BYTES;
        let mut state = self.lock()?;
        let access_ticket = state.ticket();
        state.next_seq += 1;
        let insert_seq = state.next_seq;
        state.insert(
            key.clone(),
            CacheEntry {
                envelope: envelope.into_source(Source::Cache),
                expires_at: ttl.and_then(|t| now.checked_add(t)),
                last_access: now,
                access_ticket,
                insert_seq,
                size,
                slot: 0,
            },
        );
        self.enforce_capacity(&mut state, &key, now);
        Ok(())
    }

    fn over_capacity(&self, state: &CacheState) -> bool {
        state.entries.len() > self.config.max_entries
            || self
                .config
                .max_bytes
                .is_some_and(|max| state.memory_bytes > max)
    }

    fn enforce_capacity(&self, state: &mut CacheState, protected: &CacheKey, now: Instant) {
        if !self.over_capacity(state) {
            return;
        }

        // Expired entries go first and count as expirations.
        if state.entries.len() <= self.config.max_eviction_candidates {
            let expired: Vec<CacheKey> = state
                .entries
                .iter()
                .filter(|(k, e)| *k != protected && e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                state.remove(&key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut rng = rand::rng();
        while self.over_capacity(state) {
            let Some(victim) = select_victim(
                self.config.policy,
                &state.entries,
                &state.slots,
                protected,
                self.config.max_eviction_candidates,
                &mut rng,
            ) else {
                break;
            };
            state.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, policy = %self.config.policy, "Evicted cache entry");
        }
    }

    fn scan_sync(
        &self,
        entity_type: &EntityType,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> ConcordResult<ScanPage> {
        let pattern = KeyPattern::new(pattern)?;
        let now = Instant::now();
        let state = self.lock()?;
        let start = match cursor {
            Some(after) => Bound::Excluded(CacheKey::new(entity_type.clone(), EntityId::new(after))),
            None => Bound::Included(CacheKey::new(entity_type.clone(), EntityId::new(""))),
        };

        let count = count.max(1);
        let mut keys = Vec::new();
        for key in state
            .ordered
            .range((start, Bound::Unbounded))
            .take_while(|k| k.entity_type() == entity_type)
        {
            let live = state.entries.get(key).is_some_and(|e| !e.is_expired(now));
            if live && pattern.matches(key.entity_id().as_str()) {
                keys.push(key.clone());
                if keys.len() == count {
                    break;
                }
            }
        }

        let next_cursor = if keys.len() == count {
            keys.last().map(|k| k.entity_id().as_str().to_string())
        } else {
            None
        };
        Ok(ScanPage { keys, next_cursor })
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        self.get_sync(&CacheKey::new(entity_type.clone(), entity_id.clone()))
    }

    async fn peek(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>> {
        self.peek_sync(&CacheKey::new(entity_type.clone(), entity_id.clone()))
    }

    async fn set(&self, envelope: EntityEnvelope, ttl: Option<Duration>) -> ConcordResult<()> {
        self.set_sync(envelope, ttl)
    }

    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool> {
        let key = CacheKey::new(entity_type.clone(), entity_id.clone());
        let mut state = self.lock()?;
        Ok(state.remove(&key).is_some())
    }

    async fn scan_page(
        &self,
        entity_type: &EntityType,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> ConcordResult<ScanPage> {
        self.scan_sync(entity_type, pattern, cursor, count)
    }

    async fn ping(&self) -> ConcordResult<()> {
        self.lock().map(|_| ())
    }

    async fn stats(&self) -> ConcordResult<CacheStats> {
        let state = self.lock()?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: state.entries.len() as u64,
            memory_bytes: state.memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}
