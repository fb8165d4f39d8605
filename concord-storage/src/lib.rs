//! Concord Storage - Cache, Store and Lock Primitives
//!
//! The I/O-facing collaborators of the consistency engine:
//!
//! - [`cache`]: the cache backend contract, key encoding, pattern scans and
//!   an in-memory backend with LRU / Random / TTL eviction
//! - [`store`]: the store accessor contract and an in-memory store
//! - [`lock`]: lease-based mutual exclusion
//! - [`tombstone`]: memory of intentional deletes

pub mod cache;
pub mod lock;
pub mod store;
pub mod tombstone;

pub use cache::{
    CacheBackend, CacheKey, CacheStats, InMemoryCacheBackend, KeyPattern, KeyScan, ScanPage,
    DEFAULT_SCAN_PAGE, ENTRY_OVERHEAD_BYTES,
};
pub use lock::{InMemoryLockManager, LockManager};
pub use store::{IdPage, InMemoryStore, StoreAccessor, StoreRecord};
pub use tombstone::TombstoneRegistry;
