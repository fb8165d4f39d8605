//! Cache layer: backend contract, key encoding and the in-memory backend.
//!
//! The cache is treated as fast but untrusted. Every value it holds is an
//! [`EntityEnvelope`](concord_core::EntityEnvelope) carrying the version and
//! timestamp the engine needs to decide which side of a divergence wins.
//!
//! # Eviction
//!
//! When a `set` pushes the cache past its entry or byte budget the configured
//! [`EvictionPolicy`](concord_core::EvictionPolicy) picks victims until the
//! cache fits again:
//!
//! - `Lru`: oldest last access first
//! - `Random`: uniformly random victim
//! - `Ttl`: smallest remaining TTL first, ties broken by insertion order
//!
//! The entry just written is never a victim.

mod eviction;
pub mod key;
pub mod memory;
pub mod traits;

pub use key::{CacheKey, KeyPattern};
pub use memory::{InMemoryCacheBackend, ENTRY_OVERHEAD_BYTES};
pub use traits::{CacheBackend, CacheStats, KeyScan, ScanPage, DEFAULT_SCAN_PAGE};
