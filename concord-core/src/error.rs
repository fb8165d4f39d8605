//! Error types for Concord operations

use crate::EntityKey;
use thiserror::Error;
use uuid::Uuid;

/// Lease lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The resource is leased by another holder. Callers skip and retry later.
    #[error("Lock busy for {resource}: held by {holder}")]
    Busy { resource: String, holder: Uuid },

    #[error("Lock not held for {resource}")]
    NotHeld { resource: String },
}

/// Failures of the cache backend or the store accessor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    /// The store refused the write (e.g. a referential constraint).
    #[error("Store rejected write for {entity}: {reason}")]
    StoreRejected { entity: EntityKey, reason: String },
}

/// Envelope validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid envelope for {entity}: {reason}")]
    InvalidEnvelope { entity: EntityKey, reason: String },
}

/// Reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// A concurrent writer changed the losing side between re-fetch and the
    /// final write.
    #[error("Reconciliation conflict for {entity}: expected version {expected:?}, found {found:?}")]
    Conflict {
        entity: EntityKey,
        expected: Option<u64>,
        found: Option<u64>,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Failed to parse configuration from {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
}

/// Master error type for all Concord errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConcordError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ConcordError {
    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        BackendError::StoreUnavailable {
            reason: reason.into(),
        }
        .into()
    }

    pub fn cache_unavailable(reason: impl Into<String>) -> Self {
        BackendError::CacheUnavailable {
            reason: reason.into(),
        }
        .into()
    }

    pub fn invalid_envelope(entity: EntityKey, reason: impl Into<String>) -> Self {
        EnvelopeError::InvalidEnvelope {
            entity,
            reason: reason.into(),
        }
        .into()
    }

    pub fn is_lock_busy(&self) -> bool {
        matches!(self, Self::Lock(LockError::Busy { .. }))
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::Backend(BackendError::StoreUnavailable { .. }))
    }

    pub fn is_cache_unavailable(&self) -> bool {
        matches!(self, Self::Backend(BackendError::CacheUnavailable { .. }))
    }

    /// Errors a later pass may clear on its own. Configuration and envelope
    /// errors need an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Lock(_)
                | Self::Reconcile(_)
                | Self::Backend(BackendError::StoreUnavailable { .. })
                | Self::Backend(BackendError::CacheUnavailable { .. })
        )
    }
}

/// Result type alias for Concord operations.
pub type ConcordResult<T> = Result<T, ConcordError>;

// =============================================================================
// TESTS
// =============================================================================
