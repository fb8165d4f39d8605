//! Consistency checker.
//!
//! Compares cache and store envelopes and produces a [`ConsistencyReport`].
//! The checker never mutates either side.
//!
//! # Failure handling
//!
//! - cache unreachable: the check is abandoned (`CacheUnavailable`)
//! - store unreachable for one key: the key is counted as skipped
//! - envelope fails validation: the key is counted as an error and logged
//! - listing ids fails: the error is returned, nothing is recorded

use crate::parts::EngineParts;
use chrono::Utc;
use concord_core::{
    classify, CheckMode, Classification, ClassifyContext, ConcordResult, ConsistencyReport,
    EngineConfig, EntityId, EntityKey, EntityType, ReportTally, SampleSource,
};
use concord_storage::{KeyScan, DEFAULT_SCAN_PAGE};
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters of one check pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOptions {
    pub mode: CheckMode,
    /// Entities compared by a random sample.
    pub sample_size: usize,
    /// Entities compared concurrently and ids listed per page.
    pub batch_size: usize,
    /// Upper bound on entities probed by each sweep phase.
    pub max_instances: usize,
    /// Cap on discrepancies listed in the report.
    pub max_discrepancies: usize,
    pub orphan_grace: Duration,
}

impl CheckOptions {
    pub fn random_sample(config: &EngineConfig, sample_size: usize) -> Self {
        Self {
            mode: CheckMode::RandomSample,
            sample_size,
            batch_size: config.reconcile.batch_size,
            max_instances: config.schedule.sweep_max_instances,
            max_discrepancies: sample_size,
            orphan_grace: config.orphan_grace_period,
        }
    }

    pub fn full_sweep(config: &EngineConfig) -> Self {
        Self {
            mode: CheckMode::FullSweep,
            sample_size: 0,
            batch_size: config.schedule.sweep_batch_size,
            max_instances: config.schedule.sweep_max_instances,
            max_discrepancies: config.schedule.sweep_max_instances,
            orphan_grace: config.orphan_grace_period,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Bound each sweep phase to `max` entities.
    pub fn with_max_instances(mut self, max: usize) -> Self {
        self.max_instances = max;
        self
    }

    pub fn with_max_discrepancies(mut self, max: usize) -> Self {
        self.max_discrepancies = max;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }
}

/// What one comparison produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Classified(Classification),
    /// Neither side holds the entity.
    Absent,
    Skipped,
    Invalid,
}

/// Samples or sweeps an entity type and classifies each cache/store pair.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    parts: EngineParts,
}

impl ConsistencyChecker {
    pub fn new(parts: EngineParts) -> Self {
        Self { parts }
    }

    /// Check `entity_type`.
    ///
    /// `random_sample` compares `sample_size` randomly chosen entities;
    /// `full_sweep` visits every entity up to the configured sweep bound and
    /// lists at most `sample_size` discrepancies.
    pub async fn check(
        &self,
        entity_type: &EntityType,
        sample_size: usize,
        mode: CheckMode,
    ) -> ConcordResult<ConsistencyReport> {
        let options = match mode {
            CheckMode::RandomSample => CheckOptions::random_sample(&self.parts.config, sample_size),
            CheckMode::FullSweep => {
                CheckOptions::full_sweep(&self.parts.config).with_max_discrepancies(sample_size)
            }
        };
        self.check_with(entity_type, &options).await
    }

    pub async fn check_with(
        &self,
        entity_type: &EntityType,
        options: &CheckOptions,
    ) -> ConcordResult<ConsistencyReport> {
        if let Err(e) = self.parts.cache.ping().await {
            warn!(entity_type = %entity_type, error = %e, "Cache unavailable, consistency check paused");
            return Err(e);
        }

        let mut tally = ReportTally::new(entity_type.clone(), options.mode, options.max_discrepancies);
        match options.mode {
            CheckMode::RandomSample => self.sample_pass(entity_type, options, &mut tally).await?,
            CheckMode::FullSweep => self.sweep_pass(entity_type, options, &mut tally).await?,
        }
        let report = tally.finish();
        self.parts.stats.record_check(&report);

        info!(
            entity_type = %entity_type,
            mode = %report.mode(),
            sampled = report.sampled(),
            consistent = report.consistent(),
            stale = report.stale(),
            missing = report.missing(),
            orphaned = report.orphaned(),
            transient = report.transient(),
            errors = report.errors(),
            skipped = report.skipped(),
            ratio = report.consistency_ratio(),
            "Consistency check completed"
        );
        Ok(report)
    }

    async fn sample_pass(
        &self,
        entity_type: &EntityType,
        options: &CheckOptions,
        tally: &mut ReportTally,
    ) -> ConcordResult<()> {
        if options.sample_size == 0 {
            return Ok(());
        }
        let ids = match self.parts.config.sample_source {
            SampleSource::StoreIndex => self.sample_store_ids(entity_type, options).await?,
            SampleSource::CacheKeys => self.sample_cache_ids(entity_type, options).await?,
        };
        for chunk in ids.chunks(options.batch_size.max(1)) {
            let probes = self.probe_batch(entity_type, chunk, options.orphan_grace).await?;
            for (id, probe) in chunk.iter().zip(probes) {
                record(tally, id, probe);
            }
        }
        Ok(())
    }

    /// Reservoir-sample ids from the store index, listing at most
    /// `max_instances` ids.
    async fn sample_store_ids(
        &self,
        entity_type: &EntityType,
        options: &CheckOptions,
    ) -> ConcordResult<Vec<EntityId>> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let mut reservoir = Vec::with_capacity(options.sample_size);
        let mut seen = 0usize;
        let mut cursor: Option<EntityId> = None;
        let page_size = options.batch_size.max(1);
        loop {
            let page = self
                .parts
                .store
                .list_ids(entity_type, cursor.as_ref(), page_size)
                .await?;
            for id in page.ids {
                reservoir_push(&mut rng, &mut reservoir, &mut seen, id, options.sample_size);
            }
            cursor = page.next_cursor;
            if cursor.is_none() || seen >= options.max_instances {
                return Ok(reservoir);
            }
        }
    }

    async fn sample_cache_ids(
        &self,
        entity_type: &EntityType,
        options: &CheckOptions,
    ) -> ConcordResult<Vec<EntityId>> {
        let mut rng = StdRng::from_rng(&mut rand::rng());
        let mut reservoir = Vec::with_capacity(options.sample_size);
        let mut seen = 0usize;
        let mut scan = KeyScan::new(
            self.parts.cache.clone(),
            entity_type.clone(),
            "*",
            DEFAULT_SCAN_PAGE,
        );
        while let Some(keys) = scan.next_page().await? {
            for key in keys {
                reservoir_push(
                    &mut rng,
                    &mut reservoir,
                    &mut seen,
                    key.entity_id().clone(),
                    options.sample_size,
                );
            }
            if seen >= options.max_instances {
                break;
            }
        }
        Ok(reservoir)
    }

    /// Visit store ids page by page, then cache keys for orphans.
    ///
    /// Each phase probes at most `max_instances` entities. Cache keys already
    /// visited through the store listing are not probed again and do not count
    /// against the orphan phase. Safe to abort and rerun: nothing is written.
    async fn sweep_pass(
        &self,
        entity_type: &EntityType,
        options: &CheckOptions,
        tally: &mut ReportTally,
    ) -> ConcordResult<()> {
        let batch = options.batch_size.max(1);
        let mut listed: HashSet<EntityId> = HashSet::new();

        let mut cursor: Option<EntityId> = None;
        loop {
            let remaining = options.max_instances.saturating_sub(listed.len());
            if remaining == 0 {
                debug!(
                    entity_type = %entity_type,
                    visited = listed.len(),
                    "Store listing reached max instances"
                );
                break;
            }
            let page = self
                .parts
                .store
                .list_ids(entity_type, cursor.as_ref(), batch.min(remaining))
                .await?;
            let probes = self.probe_batch(entity_type, &page.ids, options.orphan_grace).await?;
            for (id, probe) in page.ids.iter().zip(probes) {
                record(tally, id, probe);
            }
            listed.extend(page.ids);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        let mut probed = 0usize;
        let mut scan = KeyScan::new(self.parts.cache.clone(), entity_type.clone(), "*", batch);
        while let Some(keys) = scan.next_page().await? {
            let remaining = options.max_instances.saturating_sub(probed);
            if remaining == 0 {
                debug!(entity_type = %entity_type, probed, "Orphan scan reached max instances");
                break;
            }
            let ids: Vec<EntityId> = keys
                .into_iter()
                .map(|k| k.entity_id().clone())
                .filter(|id| !listed.contains(id))
                .take(remaining)
                .collect();
            let probes = self.probe_batch(entity_type, &ids, options.orphan_grace).await?;
            for (id, probe) in ids.iter().zip(probes) {
                if let Probe::Classified(c @ (Classification::Orphaned | Classification::Transient)) =
                    probe
                {
                    record(tally, id, Probe::Classified(c));
                }
            }
            probed += ids.len();
        }
        Ok(())
    }

    async fn probe_batch(
        &self,
        entity_type: &EntityType,
        ids: &[EntityId],
        orphan_grace: Duration,
    ) -> ConcordResult<Vec<Probe>> {
        join_all(ids.iter().map(|id| self.probe(entity_type, id, orphan_grace)))
            .await
            .into_iter()
            .collect()
    }

    async fn probe(
        &self,
        entity_type: &EntityType,
        entity_id: &EntityId,
        orphan_grace: Duration,
    ) -> ConcordResult<Probe> {
        let cached = self.parts.cache.peek(entity_type, entity_id).await?;
        let stored = match self.parts.store.get_envelope(entity_type, entity_id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    error = %e,
                    "Store read failed, skipping entity"
                );
                return Ok(Probe::Skipped);
            }
        };

        let key = EntityKey::new(entity_type.clone(), entity_id.clone());
        let ctx = ClassifyContext::new(Utc::now(), orphan_grace)
            .with_tombstone(self.parts.tombstones.is_tombstoned(&key))
            .with_ignored_fields(&self.parts.config.ignored_fields);

        match classify(cached.as_ref(), stored.as_ref(), &ctx) {
            Ok(Some(classification)) => {
                debug!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    classification = classification.as_str(),
                    "Classified entity"
                );
                Ok(Probe::Classified(classification))
            }
            Ok(None) => Ok(Probe::Absent),
            Err(e) => {
                warn!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    cache_version = ?cached.as_ref().and_then(|c| c.version),
                    store_version = ?stored.as_ref().and_then(|s| s.version),
                    error = %e,
                    "Invalid envelope excluded from report"
                );
                Ok(Probe::Invalid)
            }
        }
    }
}

fn record(tally: &mut ReportTally, entity_id: &EntityId, probe: Probe) {
    match probe {
        Probe::Classified(classification) => tally.record(entity_id.clone(), classification),
        Probe::Absent => {}
        Probe::Skipped => tally.record_skipped(),
        Probe::Invalid => tally.record_error(),
    }
}

fn reservoir_push<T>(rng: &mut impl Rng, reservoir: &mut Vec<T>, seen: &mut usize, item: T, cap: usize) {
    *seen += 1;
    if reservoir.len() < cap {
        reservoir.push(item);
    } else {
        let j = rng.random_range(0..*seen);
        if j < cap {
            reservoir[j] = item;
        }
    }
}
