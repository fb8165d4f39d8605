//! Concord Core - Envelope and Policy Types
//!
//! Data types shared by every Concord crate: entity identity, the versioned
//! envelope around cached values, the error taxonomy, engine configuration
//! and the pure classification / conflict-resolution policy.
//! This crate performs no I/O.

pub mod config;
pub mod conflict;
pub mod envelope;
pub mod error;
pub mod lease;
pub mod report;
pub mod stats;

pub use config::{
    EngineConfig, EvictionConfig, EvictionPolicy, LockConfig, ReconcileConfig, SampleSource,
    SamplingConfig, ScheduleConfig,
};
pub use conflict::{classify, next_store_version, resolve_winner, stale_side, Classification, ClassifyContext};
pub use envelope::{ContentDigest, EntityEnvelope, Payload, Source};
pub use error::{
    BackendError, ConcordError, ConcordResult, ConfigError, EnvelopeError, LockError,
    ReconcileError,
};
pub use lease::LeaseToken;
pub use report::{
    CheckMode, ConsistencyReport, Discrepancy, DiscrepancyKind, ReconciliationResult, ReportTally,
};
pub use stats::{InMemoryStatsCollector, NoopStatsCollector, StatsCollector};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Separator between the entity type and entity id in encoded keys.
pub const KEY_SEPARATOR: char = ':';

/// Name of the schema/model an entity belongs to (e.g. `"user"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entity type names are used as key prefixes and may not contain the
    /// key separator or be empty.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(KEY_SEPARATOR)
    }
}

/// Identifier of an entity, unique within its [`EntityType`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }
}

macro_rules! string_newtype_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $ty {
            fn from(value: u64) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_newtype_impls!(EntityType);
string_newtype_impls!(EntityId);

/// Full identity of an entity: `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.entity_type, KEY_SEPARATOR, self.entity_id)
    }
}
