//! Victim selection for the in-memory cache.
//!
//! Selection is bounded: the precise policies scan every entry only while the
//! cache holds at most `max_candidates` entries. Above that they fall back to
//! a uniformly random victim, which is O(1).

use super::key::CacheKey;
use concord_core::EvictionPolicy;
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;

/// Accounting metadata the policies look at.
pub(crate) trait EvictionCandidate {
    fn access_ticket(&self) -> u64;
    fn insert_seq(&self) -> u64;
    fn expires_at(&self) -> Option<Instant>;
}

/// Pick the next entry to evict, never `protected`.
///
/// `slots` lists every key exactly once and backs random selection.
pub(crate) fn select_victim<E: EvictionCandidate>(
    policy: EvictionPolicy,
    entries: &HashMap<CacheKey, E>,
    slots: &[CacheKey],
    protected: &CacheKey,
    max_candidates: usize,
    rng: &mut impl Rng,
) -> Option<CacheKey> {
    let precise = entries.len() <= max_candidates;
    match policy {
        EvictionPolicy::Lru if precise => entries
            .iter()
            .filter(|(k, _)| *k != protected)
            .min_by_key(|(_, e)| e.access_ticket())
            .map(|(k, _)| k.clone()),
        EvictionPolicy::Ttl if precise => entries
            .iter()
            .filter(|(k, _)| *k != protected)
            // `None` sorts before `Some`, so map "no expiry" to the far end.
            .min_by_key(|(_, e)| (e.expires_at().is_none(), e.expires_at(), e.insert_seq()))
            .map(|(k, _)| k.clone()),
        _ => random_victim(slots, protected, rng),
    }
}

fn random_victim(slots: &[CacheKey], protected: &CacheKey, rng: &mut impl Rng) -> Option<CacheKey> {
    match slots.len() {
        0 => None,
        1 => (slots[0] != *protected).then(|| slots[0].clone()),
        len => {
            let idx = rng.random_range(0..len);
            if slots[idx] != *protected {
                Some(slots[idx].clone())
            } else {
                // Neighbour of the protected slot; still uniform over the rest
                // up to a factor of two for one key.
                Some(slots[(idx + 1) % len].clone())
            }
        }
    }
}
