//! Stats collector interface.
//!
//! The engine records every check and reconciliation through an injected
//! [`StatsCollector`]. There is no process-wide singleton: each engine owns
//! its collector, and tests substitute their own.

use crate::report::{ConsistencyReport, ReconciliationResult};
use crate::EntityType;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::RwLock;

/// Sink for consistency statistics.
pub trait StatsCollector: Send + Sync {
    fn record_check(&self, report: &ConsistencyReport);

    fn record_reconcile(&self, entity_type: &EntityType, result: &ReconciliationResult);

    /// Current rolling consistency ratio for `entity_type`, if any check ran.
    fn consistency_ratio(&self, entity_type: &EntityType) -> Option<f64>;

    /// Rolling ratios for every entity type checked so far.
    fn consistency_ratios(&self) -> BTreeMap<String, f64>;
}

/// Collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatsCollector;

impl StatsCollector for NoopStatsCollector {
    fn record_check(&self, _report: &ConsistencyReport) {}

    fn record_reconcile(&self, _entity_type: &EntityType, _result: &ReconciliationResult) {}

    fn consistency_ratio(&self, _entity_type: &EntityType) -> Option<f64> {
        None
    }

    fn consistency_ratios(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }
}

/// Default rolling window.
pub const DEFAULT_RATIO_WINDOW: usize = 16;

#[derive(Debug, Default)]
struct TypeGauge {
    window: VecDeque<f64>,
    checks: u64,
    reconciled: ReconciliationResult,
}

/// In-process collector keeping the last `window` ratios per entity type.
///
/// [`StatsCollector::consistency_ratio`] reports the mean of the window; the
/// most recent value is available through [`InMemoryStatsCollector::latest_ratio`].
#[derive(Debug)]
pub struct InMemoryStatsCollector {
    window: usize,
    gauges: RwLock<HashMap<EntityType, TypeGauge>>,
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RATIO_WINDOW)
    }
}

impl InMemoryStatsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    pub fn latest_ratio(&self, entity_type: &EntityType) -> Option<f64> {
        let guard = self.gauges.read().ok()?;
        guard.get(entity_type)?.window.back().copied()
    }

    pub fn checks_recorded(&self, entity_type: &EntityType) -> u64 {
        self.gauges
            .read()
            .ok()
            .and_then(|g| g.get(entity_type).map(|gauge| gauge.checks))
            .unwrap_or(0)
    }

    /// Sum of all reconciliation results recorded for `entity_type`.
    pub fn reconciled(&self, entity_type: &EntityType) -> ReconciliationResult {
        self.gauges
            .read()
            .ok()
            .and_then(|g| g.get(entity_type).map(|gauge| gauge.reconciled.clone()))
            .unwrap_or_default()
    }
}

fn mean(window: &VecDeque<f64>) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }
}

impl StatsCollector for InMemoryStatsCollector {
    fn record_check(&self, report: &ConsistencyReport) {
        if let Ok(mut guard) = self.gauges.write() {
            let gauge = guard.entry(report.entity_type().clone()).or_default();
            gauge.checks += 1;
            gauge.window.push_back(report.consistency_ratio());
            while gauge.window.len() > self.window {
                gauge.window.pop_front();
            }
        }
    }

    fn record_reconcile(&self, entity_type: &EntityType, result: &ReconciliationResult) {
        if let Ok(mut guard) = self.gauges.write() {
            guard
                .entry(entity_type.clone())
                .or_default()
                .reconciled
                .merge(result);
        }
    }

    fn consistency_ratio(&self, entity_type: &EntityType) -> Option<f64> {
        let guard = self.gauges.read().ok()?;
        mean(&guard.get(entity_type)?.window)
    }

    fn consistency_ratios(&self) -> BTreeMap<String, f64> {
        let Ok(guard) = self.gauges.read() else {
            return BTreeMap::new();
        };
        guard
            .iter()
            .filter_map(|(ty, gauge)| mean(&gauge.window).map(|r| (ty.to_string(), r)))
            .collect()
    }
}
