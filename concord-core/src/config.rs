//! Configuration types

use crate::error::{ConcordResult, ConfigError};
use crate::EntityType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

pub const DEFAULT_CHECK_PROBABILITY: f64 = 0.01;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_CONSISTENCY_THRESHOLD: f64 = 0.95;
pub const DEFAULT_AUTO_RECONCILE_THRESHOLD: f64 = 0.90;
pub const DEFAULT_SAMPLE_SIZE: usize = 100;
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 30;
pub const DEFAULT_ENTRY_TTL_SECS: u64 = 3600;
pub const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 86_400;

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_EVICTION_CANDIDATES: usize = 1024;

pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCK_ACQUIRE_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOCK_BACKOFF_MS: u64 = 25;

pub const DEFAULT_RECONCILE_BATCH_SIZE: usize = 100;
pub const DEFAULT_RECONCILE_MAX_INSTANCES: usize = 1000;

pub const DEFAULT_SAMPLING_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SAMPLING_MAX_IN_FLIGHT: usize = 4;

pub const DEFAULT_DAILY_CHECK_SECS: u64 = 86_400;
pub const DEFAULT_WEEKLY_RECONCILE_SECS: u64 = 604_800;
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 500;
pub const DEFAULT_SWEEP_MAX_INSTANCES: usize = 100_000;

// ============================================================================
// EVICTION POLICY
// ============================================================================

/// Strategy applied by the cache when a capacity limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Oldest last access first.
    #[default]
    Lru,
    /// Uniformly random victim.
    Random,
    /// Smallest remaining time-to-live first, ties by insertion order.
    Ttl,
}

impl EvictionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Random => "random",
            EvictionPolicy::Ttl => "ttl",
        }
    }
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            "random" => Ok(EvictionPolicy::Random),
            "ttl" => Ok(EvictionPolicy::Ttl),
            _ => Err(ConfigError::InvalidValue {
                field: "eviction.policy".to_string(),
                value: s.to_string(),
                reason: "expected one of lru, random, ttl".to_string(),
            }),
        }
    }
}

/// Where random samples draw their entity ids from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    /// Ids listed by the store (finds `missing` entries).
    #[default]
    StoreIndex,
    /// Keys present in the cache (finds `orphaned` entries).
    CacheKeys,
}

impl FromStr for SampleSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "store_index" | "store" => Ok(SampleSource::StoreIndex),
            "cache_keys" | "cache" => Ok(SampleSource::CacheKeys),
            _ => Err(ConfigError::InvalidValue {
                field: "sample_source".to_string(),
                value: s.to_string(),
                reason: "expected store_index or cache_keys".to_string(),
            }),
        }
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Cache capacity limits and eviction behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub policy: EvictionPolicy,
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Optional byte budget on the memory estimate.
    pub max_bytes: Option<u64>,
    /// Largest candidate set the precise policies may scan per victim;
    /// above it the pass falls back to random selection.
    pub max_eviction_candidates: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::Lru,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: None,
            max_eviction_candidates: DEFAULT_MAX_EVICTION_CANDIDATES,
        }
    }
}

/// Lease lock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "duration_ms", rename = "lease_ttl_ms")]
    pub lease_ttl: Duration,
    /// Attempts before giving up with `LockBusy`.
    pub acquire_attempts: u32,
    /// Linear backoff step between attempts.
    #[serde(with = "duration_ms", rename = "acquire_backoff_ms")]
    pub acquire_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            acquire_attempts: DEFAULT_LOCK_ACQUIRE_ATTEMPTS,
            acquire_backoff: Duration::from_millis(DEFAULT_LOCK_BACKOFF_MS),
        }
    }
}

/// Default bounds for a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub batch_size: usize,
    pub max_instances: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_RECONCILE_BATCH_SIZE,
            max_instances: DEFAULT_RECONCILE_MAX_INSTANCES,
        }
    }
}

/// Request-path sampling limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Hard timeout after which a dispatched check is abandoned.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Checks allowed in flight at once; further triggers are dropped.
    pub max_in_flight: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_SAMPLING_TIMEOUT_MS),
            max_in_flight: DEFAULT_SAMPLING_MAX_IN_FLIGHT,
        }
    }
}

/// Periodic sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "duration_ms", rename = "check_interval_ms")]
    pub check_interval: Duration,
    #[serde(with = "duration_ms", rename = "reconcile_interval_ms")]
    pub reconcile_interval: Duration,
    /// Whether the weekly reconcile lets the store win unconditionally.
    pub force_reconcile: bool,
    pub sweep_batch_size: usize,
    pub sweep_max_instances: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_DAILY_CHECK_SECS),
            reconcile_interval: Duration::from_secs(DEFAULT_WEEKLY_RECONCILE_SECS),
            force_reconcile: false,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            sweep_max_instances: DEFAULT_SWEEP_MAX_INSTANCES,
        }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Master configuration for the consistency engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request probability of triggering a sampled check.
    pub check_probability: f64,
    /// Minimum interval between sampled checks of the same entity type.
    #[serde(with = "duration_ms", rename = "check_interval_per_type_ms")]
    pub check_interval_per_type: Duration,
    /// Ratio below which a report is considered unhealthy.
    pub consistency_threshold: f64,
    /// Ratio below which a sampled check triggers reconciliation.
    pub auto_reconcile_threshold: f64,
    pub sample_size: usize,
    pub sample_source: SampleSource,
    /// How long a cache entry without a store record is treated as
    /// in-flight rather than orphaned.
    #[serde(with = "duration_ms", rename = "orphan_grace_period_ms")]
    pub orphan_grace_period: Duration,
    /// TTL for entity types without an override; `None` never expires.
    #[serde(with = "opt_duration_ms", rename = "default_ttl_ms")]
    pub default_ttl: Option<Duration>,
    #[serde(with = "duration_ms_map", rename = "per_type_ttl_ms")]
    pub per_type_ttl: BTreeMap<String, Duration>,
    /// How long intentional deletes are remembered.
    #[serde(with = "duration_ms", rename = "tombstone_ttl_ms")]
    pub tombstone_ttl: Duration,
    /// Top-level payload fields excluded from content comparison.
    pub ignored_fields: Vec<String>,
    pub eviction: EvictionConfig,
    pub lock: LockConfig,
    pub reconcile: ReconcileConfig,
    pub sampling: SamplingConfig,
    pub schedule: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_probability: DEFAULT_CHECK_PROBABILITY,
            check_interval_per_type: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            consistency_threshold: DEFAULT_CONSISTENCY_THRESHOLD,
            auto_reconcile_threshold: DEFAULT_AUTO_RECONCILE_THRESHOLD,
            sample_size: DEFAULT_SAMPLE_SIZE,
            sample_source: SampleSource::StoreIndex,
            orphan_grace_period: Duration::from_secs(DEFAULT_ORPHAN_GRACE_SECS),
            default_ttl: Some(Duration::from_secs(DEFAULT_ENTRY_TTL_SECS)),
            per_type_ttl: BTreeMap::new(),
            tombstone_ttl: Duration::from_secs(DEFAULT_TOMBSTONE_TTL_SECS),
            ignored_fields: Vec::new(),
            eviction: EvictionConfig::default(),
            lock: LockConfig::default(),
            reconcile: ReconcileConfig::default(),
            sampling: SamplingConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl EngineConfig {
    /// TTL applied to cache entries of `entity_type`.
    pub fn ttl_for(&self, entity_type: &EntityType) -> Option<Duration> {
        self.per_type_ttl
            .get(entity_type.as_str())
            .copied()
            .or(self.default_ttl)
    }

    pub fn with_check_probability(mut self, probability: f64) -> Self {
        self.check_probability = probability;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_orphan_grace_period(mut self, grace: Duration) -> Self {
        self.orphan_grace_period = grace;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionConfig) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_type_ttl(mut self, entity_type: impl Into<String>, ttl: Duration) -> Self {
        self.per_type_ttl.insert(entity_type.into(), ttl);
        self
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(input: &str) -> ConcordResult<Self> {
        let config: EngineConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            source_name: "toml".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build from defaults overridden by `CONCORD_*` environment variables.
    ///
    /// Environment variables:
    /// - `CONCORD_CHECK_PROBABILITY`
    /// - `CONCORD_CHECK_INTERVAL_SECS`
    /// - `CONCORD_CONSISTENCY_THRESHOLD`
    /// - `CONCORD_AUTO_RECONCILE_THRESHOLD`
    /// - `CONCORD_SAMPLE_SIZE`
    /// - `CONCORD_SAMPLE_SOURCE` (`store_index` | `cache_keys`)
    /// - `CONCORD_ORPHAN_GRACE_SECS`
    /// - `CONCORD_DEFAULT_TTL_SECS` (`0` disables expiry)
    /// - `CONCORD_EVICTION_POLICY` (`lru` | `random` | `ttl`)
    /// - `CONCORD_CACHE_MAX_ENTRIES`
    /// - `CONCORD_CACHE_MAX_BYTES`
    /// - `CONCORD_LEASE_TTL_SECS`
    ///
    /// A variable that is set but malformed is an error, not a silent default.
    pub fn from_env() -> ConcordResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> ConcordResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<f64, _>(&lookup, "CONCORD_CHECK_PROBABILITY")? {
            config.check_probability = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CONCORD_CHECK_INTERVAL_SECS")? {
            config.check_interval_per_type = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "CONCORD_CONSISTENCY_THRESHOLD")? {
            config.consistency_threshold = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "CONCORD_AUTO_RECONCILE_THRESHOLD")? {
            config.auto_reconcile_threshold = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "CONCORD_SAMPLE_SIZE")? {
            config.sample_size = v;
        }
        if let Some(v) = parse_var::<SampleSource, _>(&lookup, "CONCORD_SAMPLE_SOURCE")? {
            config.sample_source = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CONCORD_ORPHAN_GRACE_SECS")? {
            config.orphan_grace_period = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CONCORD_DEFAULT_TTL_SECS")? {
            config.default_ttl = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse_var::<EvictionPolicy, _>(&lookup, "CONCORD_EVICTION_POLICY")? {
            config.eviction.policy = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "CONCORD_CACHE_MAX_ENTRIES")? {
            config.eviction.max_entries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CONCORD_CACHE_MAX_BYTES")? {
            config.eviction.max_bytes = Some(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "CONCORD_LEASE_TTL_SECS")? {
            config.lock.lease_ttl = Duration::from_secs(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - probabilities and thresholds in [0.0, 1.0]
    /// - auto_reconcile_threshold <= consistency_threshold
    /// - sizes and lease/timeout durations are positive
    pub fn validate(&self) -> ConcordResult<()> {
        check_unit_interval("check_probability", self.check_probability)?;
        check_unit_interval("consistency_threshold", self.consistency_threshold)?;
        check_unit_interval("auto_reconcile_threshold", self.auto_reconcile_threshold)?;

        if self.auto_reconcile_threshold > self.consistency_threshold {
            return Err(ConfigError::IncompatibleOptions {
                option_a: format!("auto_reconcile_threshold={}", self.auto_reconcile_threshold),
                option_b: format!("consistency_threshold={}", self.consistency_threshold),
            }
            .into());
        }

        check_positive("sample_size", self.sample_size)?;
        check_positive("eviction.max_entries", self.eviction.max_entries)?;
        check_positive(
            "eviction.max_eviction_candidates",
            self.eviction.max_eviction_candidates,
        )?;
        if self.eviction.max_bytes == Some(0) {
            return Err(invalid("eviction.max_bytes", "0", "max_bytes must be positive when set"));
        }
        check_positive("reconcile.batch_size", self.reconcile.batch_size)?;
        check_positive("reconcile.max_instances", self.reconcile.max_instances)?;
        check_positive("sampling.max_in_flight", self.sampling.max_in_flight)?;
        check_positive("schedule.sweep_batch_size", self.schedule.sweep_batch_size)?;
        check_positive("schedule.sweep_max_instances", self.schedule.sweep_max_instances)?;

        if self.lock.acquire_attempts == 0 {
            return Err(invalid("lock.acquire_attempts", "0", "at least one attempt is required"));
        }

        for (field, value) in [
            ("lock.lease_ttl", self.lock.lease_ttl),
            ("sampling.timeout", self.sampling.timeout),
            ("schedule.check_interval", self.schedule.check_interval),
            ("schedule.reconcile_interval", self.schedule.reconcile_interval),
            ("tombstone_ttl", self.tombstone_ttl),
        ] {
            if value.is_zero() {
                return Err(invalid(field, &format!("{:?}", value), "duration must be positive"));
            }
        }

        if let Some(ttl) = self.default_ttl {
            if ttl.is_zero() {
                return Err(invalid("default_ttl", "0", "use no TTL instead of a zero TTL"));
            }
        }
        for (entity_type, ttl) in &self.per_type_ttl {
            if ttl.is_zero() {
                return Err(invalid(
                    &format!("per_type_ttl.{}", entity_type),
                    "0",
                    "per-type TTL must be positive",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::ConcordError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn check_unit_interval(field: &str, value: f64) -> ConcordResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(
            field,
            &value.to_string(),
            "must be between 0.0 and 1.0",
        ));
    }
    Ok(())
}

fn check_positive(field: &str, value: usize) -> ConcordResult<()> {
    if value == 0 {
        return Err(invalid(field, "0", "must be greater than 0"));
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, name: &str) -> ConcordResult<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ConfigError::Parse {
                source_name: name.to_string(),
                reason: format!("{:?}: {}", raw, e),
            }
            .into()
        }),
    }
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// `0` encodes "no duration" so the value survives formats without null.
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.map(|d| d.as_millis() as u64).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

mod duration_ms_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &BTreeMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(k, v)| (k.clone(), v.as_millis() as u64))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Duration>, D::Error> {
        let raw = BTreeMap::<String, u64>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConcordError;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_probability_out_of_range_rejected() {
        let config = EngineConfig::default().with_check_probability(1.5);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConcordError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "check_probability"));
    }

    #[test]
    fn test_auto_reconcile_above_consistency_rejected() {
        let config = EngineConfig {
            auto_reconcile_threshold: 0.99,
            consistency_threshold: 0.9,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConcordError::Config(ConfigError::IncompatibleOptions { .. }))
        ));
    }

    #[test]
    fn test_zero_sample_size_rejected() {
        let config = EngineConfig::default().with_sample_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_for_prefers_override() {
        let config = EngineConfig::default().with_type_ttl("session", Duration::from_secs(60));
        assert_eq!(
            config.ttl_for(&EntityType::new("session")),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            config.ttl_for(&EntityType::new("user")),
            Some(Duration::from_secs(DEFAULT_ENTRY_TTL_SECS))
        );
    }

    #[test]
    fn test_from_toml_partial_document() {
        let config = EngineConfig::from_toml_str(
            r#"
            check_probability = 0.05
            sample_size = 20
            default_ttl_ms = 0

            [per_type_ttl_ms]
            session = 60000

            [eviction]
            policy = "ttl"
            max_entries = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.check_probability, 0.05);
        assert_eq!(config.sample_size, 20);
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.eviction.policy, EvictionPolicy::Ttl);
        assert_eq!(config.eviction.max_entries, 500);
        assert_eq!(
            config.ttl_for(&EntityType::new("session")),
            Some(Duration::from_secs(60))
        );
        assert_eq!(config.lock, LockConfig::default());
    }

    #[test]
    fn test_from_toml_malformed_threshold_is_fatal() {
        let err = EngineConfig::from_toml_str("consistency_threshold = \"high\"").unwrap_err();
        assert!(matches!(err, ConcordError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CONCORD_CHECK_PROBABILITY", "0.2"),
            ("CONCORD_EVICTION_POLICY", "random"),
            ("CONCORD_DEFAULT_TTL_SECS", "0"),
            ("CONCORD_SAMPLE_SOURCE", "cache_keys"),
        ]
        .into_iter()
        .collect();
        let config =
            EngineConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.check_probability, 0.2);
        assert_eq!(config.eviction.policy, EvictionPolicy::Random);
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.sample_source, SampleSource::CacheKeys);
    }

    #[test]
    fn test_from_lookup_malformed_value_errors() {
        let result = EngineConfig::from_lookup(|name| {
            (name == "CONCORD_SAMPLE_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(
            result,
            Err(ConcordError::Config(ConfigError::Parse { .. }))
        ));
    }

    #[test]
    fn test_eviction_policy_roundtrip() {
        for policy in [EvictionPolicy::Lru, EvictionPolicy::Random, EvictionPolicy::Ttl] {
            assert_eq!(policy.as_str().parse::<EvictionPolicy>().unwrap(), policy);
        }
        assert!("fifo".parse::<EvictionPolicy>().is_err());
    }
}
