//! Prometheus stats collector.
//!
//! Each collector owns its own [`Registry`], so several engines (or tests)
//! in one process never collide on metric names.

use concord_core::{
    ConsistencyReport, DiscrepancyKind, EntityType, InMemoryStatsCollector, ReconciliationResult,
    StatsCollector,
};
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

/// [`StatsCollector`] exporting Prometheus metrics.
///
/// Rolling ratios are kept by an inner [`InMemoryStatsCollector`]; the
/// `concord_consistency_ratio` gauge mirrors its rolling mean.
pub struct PrometheusStatsCollector {
    registry: Registry,
    rolling: InMemoryStatsCollector,
    /// Labels: entity_type
    consistency_ratio: GaugeVec,
    /// Labels: entity_type, mode
    checks_total: CounterVec,
    /// Labels: entity_type, kind
    discrepancies_total: CounterVec,
    /// Labels: entity_type, outcome
    reconcile_outcomes_total: CounterVec,
}

impl PrometheusStatsCollector {
    /// Create the collector and register its metrics with a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the metrics with an existing registry.
    pub fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let consistency_ratio = GaugeVec::new(
            Opts::new(
                "concord_consistency_ratio",
                "Rolling consistent / sampled ratio per entity type",
            ),
            &["entity_type"],
        )?;
        let checks_total = CounterVec::new(
            Opts::new("concord_checks_total", "Consistency checks completed"),
            &["entity_type", "mode"],
        )?;
        let discrepancies_total = CounterVec::new(
            Opts::new(
                "concord_discrepancies_total",
                "Discrepancies found by consistency checks",
            ),
            &["entity_type", "kind"],
        )?;
        let reconcile_outcomes_total = CounterVec::new(
            Opts::new(
                "concord_reconcile_outcomes_total",
                "Per-key reconciliation outcomes",
            ),
            &["entity_type", "outcome"],
        )?;

        registry.register(Box::new(consistency_ratio.clone()))?;
        registry.register(Box::new(checks_total.clone()))?;
        registry.register(Box::new(discrepancies_total.clone()))?;
        registry.register(Box::new(reconcile_outcomes_total.clone()))?;

        Ok(Self {
            registry,
            rolling: InMemoryStatsCollector::default(),
            consistency_ratio,
            checks_total,
            discrepancies_total,
            reconcile_outcomes_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for PrometheusStatsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusStatsCollector")
            .field("rolling", &self.rolling)
            .finish_non_exhaustive()
    }
}

impl StatsCollector for PrometheusStatsCollector {
    fn record_check(&self, report: &ConsistencyReport) {
        self.rolling.record_check(report);
        let entity_type = report.entity_type().as_str();

        self.checks_total
            .with_label_values(&[entity_type, report.mode().as_str()])
            .inc();
        for (kind, count) in [
            (DiscrepancyKind::Stale, report.stale()),
            (DiscrepancyKind::Missing, report.missing()),
            (DiscrepancyKind::Orphaned, report.orphaned()),
        ] {
            if count > 0 {
                self.discrepancies_total
                    .with_label_values(&[entity_type, kind.as_str()])
                    .inc_by(count as f64);
            }
        }
        if let Some(ratio) = self.rolling.consistency_ratio(report.entity_type()) {
            self.consistency_ratio
                .with_label_values(&[entity_type])
                .set(ratio);
        }
    }

    fn record_reconcile(&self, entity_type: &EntityType, result: &ReconciliationResult) {
        self.rolling.record_reconcile(entity_type, result);
        for (outcome, count) in [
            ("updated", result.updated),
            ("skipped", result.skipped),
            ("errors", result.errors),
            ("unchanged", result.unchanged),
        ] {
            if count > 0 {
                self.reconcile_outcomes_total
                    .with_label_values(&[entity_type.as_str(), outcome])
                    .inc_by(count as f64);
            }
        }
    }

    fn consistency_ratio(&self, entity_type: &EntityType) -> Option<f64> {
        self.rolling.consistency_ratio(entity_type)
    }

    fn consistency_ratios(&self) -> BTreeMap<String, f64> {
        self.rolling.consistency_ratios()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{CheckMode, Classification, ReportTally};

    fn report() -> ConsistencyReport {
        let mut tally = ReportTally::new(EntityType::new("user"), CheckMode::FullSweep, 10);
        tally.record("1".into(), Classification::Consistent);
        tally.record("2".into(), Classification::Missing);
        tally.record("3".into(), Classification::Missing);
        tally.record("4".into(), Classification::Consistent);
        tally.finish()
    }

    #[test]
    fn test_collectors_do_not_share_registries() {
        assert!(PrometheusStatsCollector::new().is_ok());
        assert!(PrometheusStatsCollector::new().is_ok());
    }

    #[test]
    fn test_record_check_exports_metrics() {
        let collector = PrometheusStatsCollector::new().unwrap();
        collector.record_check(&report());
        let text = collector.encode().unwrap();
        assert!(text.contains("concord_checks_total{entity_type=\"user\",mode=\"full_sweep\"} 1"));
        assert!(text.contains("concord_discrepancies_total{entity_type=\"user\",kind=\"missing\"} 2"));
        assert!(text.contains("concord_consistency_ratio{entity_type=\"user\"} 0.5"));
        assert_eq!(
            collector.consistency_ratio(&EntityType::new("user")),
            Some(0.5)
        );
    }

    #[test]
    fn test_record_reconcile_exports_outcomes() {
        let collector = PrometheusStatsCollector::new().unwrap();
        let result = ReconciliationResult {
            updated: 3,
            skipped: 1,
            ..Default::default()
        };
        collector.record_reconcile(&EntityType::new("order"), &result);
        let text = collector.encode().unwrap();
        assert!(text.contains(
            "concord_reconcile_outcomes_total{entity_type=\"order\",outcome=\"updated\"} 3"
        ));
        assert!(!text.contains("outcome=\"errors\""));
    }
}
