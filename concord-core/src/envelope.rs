//! Entity envelope: the versioned, timestamped wrapper around a cached value.

use crate::error::EnvelopeError;
use crate::{EntityId, EntityKey, EntityType, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::fmt;

/// Which side produced an envelope instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Store,
}

impl Source {
    pub fn opposite(self) -> Self {
        match self {
            Source::Cache => Source::Store,
            Source::Store => Source::Cache,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Store => "store",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SHA-256 digest of a payload's canonical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes as hex, enough to correlate log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Cached payload.
///
/// The engine does not own the serialization format. Payloads are either an
/// opaque blob compared byte-for-byte, or a structured JSON document whose
/// fields are compared structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Opaque(Vec<u8>),
    Structured(Value),
}

impl Payload {
    pub fn opaque(bytes: impl Into<Vec<u8>>) -> Self {
        Payload::Opaque(bytes.into())
    }

    pub fn structured(value: Value) -> Self {
        Payload::Structured(value)
    }

    /// Canonical bytes used for digests and memory accounting.
    pub fn canonical_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Payload::Opaque(bytes) => Cow::Borrowed(bytes.as_slice()),
            // serde_json maps are ordered, so the encoding is stable.
            Payload::Structured(value) => Cow::Owned(value.to_string().into_bytes()),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Payload::Opaque(bytes) => bytes.len(),
            Payload::Structured(value) => value.to_string().len(),
        }
    }

    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(&self.canonical_bytes())
    }

    /// Structured view of the payload. Opaque payloads are parsed as JSON.
    fn as_structured(&self) -> Result<Cow<'_, Value>, String> {
        match self {
            Payload::Structured(value) => Ok(Cow::Borrowed(value)),
            Payload::Opaque(bytes) => serde_json::from_slice(bytes)
                .map(Cow::Owned)
                .map_err(|e| format!("opaque payload is not comparable JSON: {}", e)),
        }
    }

    /// Compare the structurally comparable content of two payloads.
    ///
    /// Top-level fields named in `ignored_fields` are excluded (bookkeeping
    /// fields such as `updated_at`). Two opaque payloads are compared as
    /// bytes when no fields are ignored. Returns `Err` with a reason when a
    /// payload cannot be brought into comparable form.
    pub fn content_eq(&self, other: &Payload, ignored_fields: &[String]) -> Result<bool, String> {
        if let (Payload::Opaque(a), Payload::Opaque(b)) = (self, other) {
            if ignored_fields.is_empty() {
                return Ok(a == b);
            }
            // Non-JSON blobs have no fields to ignore.
            if let (Ok(left), Ok(right)) = (self.as_structured(), other.as_structured()) {
                return Ok(strip_fields(&left, ignored_fields)
                    == strip_fields(&right, ignored_fields));
            }
            return Ok(a == b);
        }

        let left = self.as_structured()?;
        let right = other.as_structured()?;
        if ignored_fields.is_empty() {
            return Ok(left == right);
        }
        Ok(strip_fields(&left, ignored_fields) == strip_fields(&right, ignored_fields))
    }
}

fn strip_fields(value: &Value, ignored: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !ignored.iter().any(|field| field == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// One cacheable unit of domain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEnvelope {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Payload,
    /// Incremented on every mutation; `None` when the producer does not track
    /// versions, in which case `last_updated` decides conflicts.
    pub version: Option<u64>,
    pub last_updated: Timestamp,
    pub source: Source,
}

impl EntityEnvelope {
    /// Create an unversioned envelope stamped with the current time.
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        payload: Payload,
        source: Source,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            payload,
            version: None,
            last_updated: Utc::now(),
            source,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_last_updated(mut self, last_updated: Timestamp) -> Self {
        self.last_updated = last_updated;
        self
    }

    /// Re-tag the envelope as produced by `source`, e.g. when a store value is
    /// copied into the cache.
    pub fn into_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Version with "absent" treated as zero.
    pub fn version_or_zero(&self) -> u64 {
        self.version.unwrap_or(0)
    }

    /// Approximate bytes held by this envelope.
    pub fn size_bytes(&self) -> usize {
        self.entity_type.as_str().len() + self.entity_id.as_str().len() + self.payload.size_bytes()
    }

    /// Structural validation performed before any comparison.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        let invalid = |reason: &str| EnvelopeError::InvalidEnvelope {
            entity: self.key(),
            reason: reason.to_string(),
        };
        if !self.entity_type.is_valid() {
            return Err(invalid("entity_type must be non-empty and contain no ':'"));
        }
        if !self.entity_id.is_valid() {
            return Err(invalid("entity_id must be non-empty"));
        }
        if let Payload::Structured(value) = &self.payload {
            if !(value.is_object() || value.is_array()) {
                return Err(invalid("structured payload must be a JSON object or array"));
            }
        }
        Ok(())
    }

    /// Whether both envelopes carry the same content.
    pub fn content_matches(
        &self,
        other: &EntityEnvelope,
        ignored_fields: &[String],
    ) -> Result<bool, EnvelopeError> {
        self.payload
            .content_eq(&other.payload, ignored_fields)
            .map_err(|reason| EnvelopeError::InvalidEnvelope {
                entity: self.key(),
                reason,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structured(value: Value) -> EntityEnvelope {
        EntityEnvelope::new("user", "1", Payload::structured(value), Source::Cache)
    }

    #[test]
    fn test_structured_comparison_ignores_key_order() {
        let a = Payload::structured(json!({"name": "ada", "age": 36}));
        let b = Payload::structured(json!({"age": 36, "name": "ada"}));
        assert_eq!(a.content_eq(&b, &[]), Ok(true));
    }

    #[test]
    fn test_ignored_fields_excluded() {
        let a = Payload::structured(json!({"name": "ada", "updated_at": "t1"}));
        let b = Payload::structured(json!({"name": "ada", "updated_at": "t2"}));
        assert_eq!(a.content_eq(&b, &[]), Ok(false));
        assert_eq!(a.content_eq(&b, &["updated_at".to_string()]), Ok(true));
    }

    #[test]
    fn test_opaque_vs_structured_parses_json() {
        let a = Payload::opaque(br#"{"x":1}"#.to_vec());
        let b = Payload::structured(json!({"x": 1}));
        assert_eq!(a.content_eq(&b, &[]), Ok(true));

        let garbage = Payload::opaque(vec![0xff, 0x00]);
        assert!(garbage.content_eq(&b, &[]).is_err());
    }

    #[test]
    fn test_opaque_bytes_compare_without_parsing() {
        let a = Payload::opaque(vec![0xff, 0x01]);
        let b = Payload::opaque(vec![0xff, 0x01]);
        assert_eq!(a.content_eq(&b, &[]), Ok(true));
    }

    #[test]
    fn test_validate_rejects_scalar_structured_payload() {
        let env = structured(json!(5));
        assert!(env.validate().is_err());
        assert!(structured(json!({"a": 1})).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_identity() {
        let env = EntityEnvelope::new("a:b", "1", Payload::opaque(b"x".to_vec()), Source::Store);
        assert!(env.validate().is_err());
        let env = EntityEnvelope::new("user", "", Payload::opaque(b"x".to_vec()), Source::Store);
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Payload::structured(json!({"b": 2, "a": 1}));
        let b = Payload::structured(json!({"a": 1, "b": 2}));
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().short_hex().len(), 16);
    }

    #[test]
    fn test_into_source_and_version() {
        let env = structured(json!({})).with_version(3).into_source(Source::Store);
        assert_eq!(env.source, Source::Store);
        assert_eq!(env.version_or_zero(), 3);
        assert_eq!(Source::Store.opposite(), Source::Cache);
    }
}
