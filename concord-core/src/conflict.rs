//! Classification and conflict-resolution policy.
//!
//! Pure functions over a pair of envelopes. The checker uses [`classify`] to
//! build reports and the reconciler re-runs it on freshly fetched state
//! before acting.

use crate::envelope::{EntityEnvelope, Source};
use crate::error::EnvelopeError;
use crate::Timestamp;
use std::time::Duration;

/// Outcome of comparing the cache and store envelopes of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Consistent,
    /// Content differs; `stale_side` holds the lower version or older
    /// timestamp and is the side a repair overwrites.
    Stale { stale_side: Source },
    /// Present in the store, absent from the cache.
    Missing,
    /// Present in the cache, absent from the store, and not transient.
    Orphaned,
    /// Present only in the cache but recent enough that the store write may
    /// still be in flight. Not counted as sampled.
    Transient,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Consistent => "consistent",
            Classification::Stale { .. } => "stale",
            Classification::Missing => "missing",
            Classification::Orphaned => "orphaned",
            Classification::Transient => "transient",
        }
    }

    pub fn needs_repair(&self) -> bool {
        matches!(
            self,
            Classification::Stale { .. } | Classification::Missing | Classification::Orphaned
        )
    }
}

/// Inputs to [`classify`] beyond the two envelopes.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub now: Timestamp,
    pub orphan_grace: Duration,
    /// The entity was deleted on purpose; a surviving cache entry is an
    /// orphan regardless of its age.
    pub tombstoned: bool,
    pub ignored_fields: &'a [String],
}

impl<'a> ClassifyContext<'a> {
    pub fn new(now: Timestamp, orphan_grace: Duration) -> Self {
        Self {
            now,
            orphan_grace,
            tombstoned: false,
            ignored_fields: &[],
        }
    }

    pub fn with_tombstone(mut self, tombstoned: bool) -> Self {
        self.tombstoned = tombstoned;
        self
    }

    pub fn with_ignored_fields(mut self, fields: &'a [String]) -> Self {
        self.ignored_fields = fields;
        self
    }

    fn within_grace(&self, last_updated: Timestamp) -> bool {
        match chrono::Duration::from_std(self.orphan_grace) {
            Ok(grace) => self.now.signed_duration_since(last_updated) < grace,
            // Grace beyond chrono's range covers every timestamp.
            Err(_) => true,
        }
    }
}

/// Classify one `(cache, store)` pair.
///
/// Returns `Ok(None)` when both sides are absent (the pair is not sampled).
/// Envelopes failing validation or content comparison produce
/// `EnvelopeError::InvalidEnvelope`.
pub fn classify(
    cache: Option<&EntityEnvelope>,
    store: Option<&EntityEnvelope>,
    ctx: &ClassifyContext<'_>,
) -> Result<Option<Classification>, EnvelopeError> {
    if let Some(c) = cache {
        c.validate()?;
    }
    if let Some(s) = store {
        s.validate()?;
    }

    let classification = match (cache, store) {
        (None, None) => return Ok(None),
        (None, Some(_)) => Classification::Missing,
        (Some(c), None) => {
            if !ctx.tombstoned && ctx.within_grace(c.last_updated) {
                Classification::Transient
            } else {
                Classification::Orphaned
            }
        }
        (Some(c), Some(s)) => {
            if c.content_matches(s, ctx.ignored_fields)? {
                Classification::Consistent
            } else {
                Classification::Stale {
                    stale_side: stale_side(c, s),
                }
            }
        }
    };
    Ok(Some(classification))
}

/// Side holding the older state of a differing pair.
///
/// A strictly lower version is stale when both sides carry one. Otherwise the
/// older `last_updated` is stale. A complete tie marks the cache stale so the
/// authoritative store wins.
pub fn stale_side(cache: &EntityEnvelope, store: &EntityEnvelope) -> Source {
    if let (Some(cv), Some(sv)) = (cache.version, store.version) {
        if cv != sv {
            return if cv < sv { Source::Cache } else { Source::Store };
        }
    }
    if store.last_updated < cache.last_updated {
        Source::Store
    } else {
        Source::Cache
    }
}

/// Side whose payload is written to the other during a stale repair.
pub fn resolve_winner(cache: &EntityEnvelope, store: &EntityEnvelope, force: bool) -> Source {
    if force {
        return Source::Store;
    }
    stale_side(cache, store).opposite()
}

/// Version written to the store when the cache wins, so a later comparison
/// never resurrects the older store value.
pub fn next_store_version(cache: &EntityEnvelope, store: &EntityEnvelope) -> u64 {
    cache.version_or_zero().max(store.version_or_zero()) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Payload;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn t(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn env(source: Source, payload: &str, version: Option<u64>, at: Timestamp) -> EntityEnvelope {
        let mut e = EntityEnvelope::new(
            "user",
            "1",
            Payload::structured(json!({ "name": payload })),
            source,
        )
        .with_last_updated(at);
        e.version = version;
        e
    }

    fn ctx() -> ClassifyContext<'static> {
        ClassifyContext::new(t(1000), Duration::from_secs(30))
    }

    #[test]
    fn test_both_absent_not_sampled() {
        assert_eq!(classify(None, None, &ctx()), Ok(None));
    }

    #[test]
    fn test_missing() {
        let s = env(Source::Store, "A", Some(1), t(0));
        assert_eq!(
            classify(None, Some(&s), &ctx()),
            Ok(Some(Classification::Missing))
        );
    }

    #[test]
    fn test_orphan_grace_period() {
        let recent = env(Source::Cache, "A", Some(1), t(990));
        let old = env(Source::Cache, "A", Some(1), t(900));
        assert_eq!(
            classify(Some(&recent), None, &ctx()),
            Ok(Some(Classification::Transient))
        );
        assert_eq!(
            classify(Some(&old), None, &ctx()),
            Ok(Some(Classification::Orphaned))
        );
    }

    #[test]
    fn test_tombstone_overrides_grace() {
        let recent = env(Source::Cache, "A", Some(1), t(999));
        let ctx = ctx().with_tombstone(true);
        assert_eq!(
            classify(Some(&recent), None, &ctx),
            Ok(Some(Classification::Orphaned))
        );
    }

    #[test]
    fn test_stale_cache_newer_scenario() {
        let c = env(Source::Cache, "B", Some(3), t(20));
        let s = env(Source::Store, "A", Some(2), t(10));
        assert_eq!(
            classify(Some(&c), Some(&s), &ctx()),
            Ok(Some(Classification::Stale {
                stale_side: Source::Store
            }))
        );
        assert_eq!(resolve_winner(&c, &s, false), Source::Cache);
        assert_eq!(resolve_winner(&c, &s, true), Source::Store);
        assert_eq!(next_store_version(&c, &s), 4);
    }

    #[test]
    fn test_version_beats_timestamp() {
        let c = env(Source::Cache, "B", Some(5), t(0));
        let s = env(Source::Store, "A", Some(2), t(100));
        assert_eq!(stale_side(&c, &s), Source::Store);
    }

    #[test]
    fn test_timestamp_decides_without_versions() {
        let c = env(Source::Cache, "B", None, t(0));
        let s = env(Source::Store, "A", Some(2), t(100));
        assert_eq!(stale_side(&c, &s), Source::Cache);

        let c = env(Source::Cache, "B", Some(2), t(200));
        assert_eq!(stale_side(&c, &s), Source::Store);
    }

    #[test]
    fn test_full_tie_store_wins() {
        let c = env(Source::Cache, "B", Some(2), t(5));
        let s = env(Source::Store, "A", Some(2), t(5));
        assert_eq!(resolve_winner(&c, &s, false), Source::Store);
    }

    #[test]
    fn test_invalid_envelope_is_error() {
        let mut c = env(Source::Cache, "B", Some(2), t(5));
        c.payload = Payload::structured(json!("scalar"));
        let s = env(Source::Store, "A", Some(2), t(5));
        assert!(classify(Some(&c), Some(&s), &ctx()).is_err());
    }

    fn arb_version() -> impl Strategy<Value = Option<u64>> {
        prop::option::of(0u64..100)
    }

    proptest! {
        #[test]
        fn prop_equal_payload_is_consistent(
            cv in arb_version(),
            sv in arb_version(),
            ct in -500i64..500,
            st in -500i64..500,
            name in "[a-z]{0,12}",
        ) {
            let c = env(Source::Cache, &name, cv, t(ct));
            let s = env(Source::Store, &name, sv, t(st));
            prop_assert_eq!(
                classify(Some(&c), Some(&s), &ctx()),
                Ok(Some(Classification::Consistent))
            );
        }

        #[test]
        fn prop_cache_absent_is_missing(sv in arb_version(), st in -500i64..500) {
            let s = env(Source::Store, "x", sv, t(st));
            prop_assert_eq!(
                classify(None, Some(&s), &ctx()),
                Ok(Some(Classification::Missing))
            );
        }

        #[test]
        fn prop_old_orphan_is_orphaned(cv in arb_version(), age in 31i64..10_000) {
            let c = env(Source::Cache, "x", cv, t(1000 - age));
            prop_assert_eq!(
                classify(Some(&c), None, &ctx()),
                Ok(Some(Classification::Orphaned))
            );
        }

        #[test]
        fn prop_winner_never_has_lower_version(cv in 0u64..50, sv in 0u64..50) {
            let c = env(Source::Cache, "a", Some(cv), t(0));
            let s = env(Source::Store, "b", Some(sv), t(0));
            let winner = resolve_winner(&c, &s, false);
            let (win, lose) = match winner {
                Source::Cache => (cv, sv),
                Source::Store => (sv, cv),
            };
            prop_assert!(win >= lose);
            prop_assert!(next_store_version(&c, &s) > cv.max(sv));
        }
    }
}
