//! Collaborators shared by the checker, reconciler and writer path.

use concord_core::{EngineConfig, EntityType, StatsCollector};
use concord_storage::{CacheBackend, LockManager, StoreAccessor, TombstoneRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Handles to everything the engine components talk to.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct EngineParts {
    pub cache: Arc<dyn CacheBackend>,
    pub store: Arc<dyn StoreAccessor>,
    pub locks: Arc<dyn LockManager>,
    pub tombstones: Arc<TombstoneRegistry>,
    pub stats: Arc<dyn StatsCollector>,
    pub config: Arc<EngineConfig>,
}

impl EngineParts {
    pub fn ttl_for(&self, entity_type: &EntityType) -> Option<Duration> {
        self.config.ttl_for(entity_type)
    }
}

impl std::fmt::Debug for EngineParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineParts")
            .field("config", &self.config)
            .field("tombstones", &self.tombstones.len())
            .finish_non_exhaustive()
    }
}
