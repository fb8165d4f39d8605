//! Consistency reports and reconciliation results.

use crate::conflict::Classification;
use crate::envelope::Source;
use crate::{EntityId, EntityType, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the checker chose the entities it compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    RandomSample,
    FullSweep,
}

impl CheckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckMode::RandomSample => "random_sample",
            CheckMode::FullSweep => "full_sweep",
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of divergence recorded for an offending entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscrepancyKind {
    Stale,
    Missing,
    Orphaned,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::Stale => "stale",
            DiscrepancyKind::Missing => "missing",
            DiscrepancyKind::Orphaned => "orphaned",
        }
    }
}

/// One offending entity in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub entity_id: EntityId,
    pub kind: DiscrepancyKind,
    /// Set for `Stale` only.
    pub stale_side: Option<Source>,
}

/// Result of one check pass over a single entity type.
///
/// Immutable once built; produced through [`ReportTally::finish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    entity_type: EntityType,
    mode: CheckMode,
    started_at: Timestamp,
    finished_at: Timestamp,
    consistent: u64,
    stale: u64,
    missing: u64,
    orphaned: u64,
    transient: u64,
    errors: u64,
    skipped: u64,
    discrepancies: Vec<Discrepancy>,
}

impl ConsistencyReport {
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn mode(&self) -> CheckMode {
        self.mode
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn finished_at(&self) -> Timestamp {
        self.finished_at
    }

    pub fn consistent(&self) -> u64 {
        self.consistent
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn missing(&self) -> u64 {
        self.missing
    }

    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }

    /// Cache-only entries still inside the orphan grace period.
    pub fn transient(&self) -> u64 {
        self.transient
    }

    /// Entities excluded because their envelope failed validation.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Entities excluded because the store could not be read.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Offending entities, capped at the sample size for random samples.
    pub fn discrepancies(&self) -> &[Discrepancy] {
        &self.discrepancies
    }

    /// Pairs that were classified into one of the four counted buckets.
    pub fn sampled(&self) -> u64 {
        self.consistent + self.stale + self.missing + self.orphaned
    }

    /// `consistent / sampled`; an empty pass is fully consistent.
    pub fn consistency_ratio(&self) -> f64 {
        let sampled = self.sampled();
        if sampled == 0 {
            1.0
        } else {
            self.consistent as f64 / sampled as f64
        }
    }

    pub fn is_healthy(&self, threshold: f64) -> bool {
        self.consistency_ratio() >= threshold
    }

    pub fn has_discrepancies(&self) -> bool {
        self.stale + self.missing + self.orphaned > 0
    }
}

/// Accumulates classifications while a check runs.
#[derive(Debug, Clone)]
pub struct ReportTally {
    report: ConsistencyReport,
    max_discrepancies: usize,
}

impl ReportTally {
    pub fn new(entity_type: EntityType, mode: CheckMode, max_discrepancies: usize) -> Self {
        let now = Utc::now();
        Self {
            report: ConsistencyReport {
                entity_type,
                mode,
                started_at: now,
                finished_at: now,
                consistent: 0,
                stale: 0,
                missing: 0,
                orphaned: 0,
                transient: 0,
                errors: 0,
                skipped: 0,
                discrepancies: Vec::new(),
            },
            max_discrepancies,
        }
    }

    pub fn record(&mut self, entity_id: EntityId, classification: Classification) {
        let (kind, stale_side) = match classification {
            Classification::Consistent => {
                self.report.consistent += 1;
                return;
            }
            Classification::Transient => {
                self.report.transient += 1;
                return;
            }
            Classification::Stale { stale_side } => {
                self.report.stale += 1;
                (DiscrepancyKind::Stale, Some(stale_side))
            }
            Classification::Missing => {
                self.report.missing += 1;
                (DiscrepancyKind::Missing, None)
            }
            Classification::Orphaned => {
                self.report.orphaned += 1;
                (DiscrepancyKind::Orphaned, None)
            }
        };
        if self.report.discrepancies.len() < self.max_discrepancies {
            self.report.discrepancies.push(Discrepancy {
                entity_id,
                kind,
                stale_side,
            });
        }
    }

    pub fn record_error(&mut self) {
        self.report.errors += 1;
    }

    pub fn record_skipped(&mut self) {
        self.report.skipped += 1;
    }

    /// Number of entities seen so far in any bucket.
    pub fn seen(&self) -> u64 {
        let r = &self.report;
        r.sampled() + r.transient + r.errors + r.skipped
    }

    pub fn finish(mut self) -> ConsistencyReport {
        self.report.finished_at = Utc::now();
        self.report
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Keys repaired by at least one write.
    pub updated: u64,
    /// Keys left alone this pass: lock busy, store unreachable or transient.
    pub skipped: u64,
    /// Keys whose repair failed: rejected writes, conflicts, invalid envelopes.
    pub errors: u64,
    /// Keys found consistent after re-fetch.
    pub unchanged: u64,
    pub cache_writes: u64,
    pub cache_deletes: u64,
    pub store_writes: u64,
}

impl ReconciliationResult {
    pub fn merge(&mut self, other: &ReconciliationResult) {
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.unchanged += other.unchanged;
        self.cache_writes += other.cache_writes;
        self.cache_deletes += other.cache_deletes;
        self.store_writes += other.store_writes;
    }

    pub fn total_writes(&self) -> u64 {
        self.cache_writes + self.cache_deletes + self.store_writes
    }

    pub fn processed(&self) -> u64 {
        self.updated + self.skipped + self.errors + self.unchanged
    }
}
