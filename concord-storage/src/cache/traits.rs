//! Cache backend trait and statistics.

use super::key::CacheKey;
use async_trait::async_trait;
use concord_core::{ConcordResult, EntityEnvelope, EntityId, EntityType};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// One page of a key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Matching keys in ascending key order.
    pub keys: Vec<CacheKey>,
    /// Cursor to pass to the next call; `None` once the scan is complete.
    pub next_cursor: Option<String>,
}

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe for concurrent use. All values are
/// [`EntityEnvelope`]s; the payload encoding is the caller's business.
///
/// # Failure
///
/// Any backend fault surfaces as `BackendError::CacheUnavailable`. Callers
/// degrade to the store rather than failing a request.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get an envelope, or `None` if absent or expired.
    async fn get(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>>;

    /// Read an envelope without counting a hit or miss and without
    /// refreshing its access order. Monitoring reads go through here.
    async fn peek(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
    ) -> ConcordResult<Option<EntityEnvelope>>;

    /// Store an envelope, replacing any previous value for its key.
    ///
    /// `ttl = None` keeps the entry until it is deleted or evicted. May evict
    /// other entries to stay within capacity.
    async fn set(&self, envelope: EntityEnvelope, ttl: Option<Duration>) -> ConcordResult<()>;

    /// Delete an entry. Idempotent; returns whether an entry was removed.
    async fn delete(&self, entity_type: &EntityType, entity_id: &EntityId) -> ConcordResult<bool>;

    /// Return up to `count` keys of `entity_type` whose id matches the glob
    /// `pattern`, strictly after `cursor`.
    async fn scan_page(
        &self,
        entity_type: &EntityType,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> ConcordResult<ScanPage>;

    /// Delete every key of `entity_type` whose id matches `pattern`.
    ///
    /// Returns the number of entries removed.
    async fn invalidate_pattern(&self, entity_type: &EntityType, pattern: &str) -> ConcordResult<u64> {
        let mut removed = 0;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .scan_page(entity_type, pattern, cursor.as_deref(), DEFAULT_SCAN_PAGE)
                .await?;
            for key in &page.keys {
                if self.delete(key.entity_type(), key.entity_id()).await? {
                    removed += 1;
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(removed),
            }
        }
    }

    /// Health probe.
    async fn ping(&self) -> ConcordResult<()>;

    /// Get cache statistics.
    async fn stats(&self) -> ConcordResult<CacheStats>;
}

/// Page size used by the provided scan helpers.
pub const DEFAULT_SCAN_PAGE: usize = 256;

/// Lazy, restartable key scan over a [`CacheBackend`].
///
/// Pages are fetched on demand. The scan is finite: keys are visited in
/// ascending order and the cursor only moves forward.
pub struct KeyScan {
    backend: Arc<dyn CacheBackend>,
    entity_type: EntityType,
    pattern: String,
    page_size: usize,
    cursor: Option<String>,
    done: bool,
}

impl KeyScan {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        entity_type: EntityType,
        pattern: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            backend,
            entity_type,
            pattern: pattern.into(),
            page_size: page_size.max(1),
            cursor: None,
            done: false,
        }
    }

    /// Next page of keys, `None` when the scan is exhausted.
    pub async fn next_page(&mut self) -> ConcordResult<Option<Vec<CacheKey>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .backend
            .scan_page(
                &self.entity_type,
                &self.pattern,
                self.cursor.as_deref(),
                self.page_size,
            )
            .await?;
        match page.next_cursor {
            Some(next) => self.cursor = Some(next),
            None => self.done = true,
        }
        if page.keys.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(page.keys))
    }

    /// Start over from the first key.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.done = false;
    }

    /// Drain the remaining pages.
    pub async fn collect_all(&mut self) -> ConcordResult<Vec<CacheKey>> {
        let mut all = Vec::new();
        while let Some(keys) = self.next_page().await? {
            all.extend(keys);
        }
        Ok(all)
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, expired reads included.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL lapsed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate the miss rate (0.0 to 1.0).
    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}
