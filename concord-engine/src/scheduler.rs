//! Scheduled consistency jobs.
//!
//! Two standing jobs run over every registered entity type:
//!
//! - a daily full-sweep check
//! - a weekly full reconcile, forced when `ScheduleConfig::force_reconcile`
//!
//! Both are idempotent and safe to overlap with request-path sampling; the
//! lease lock arbitrates per-key conflicts. External schedulers can call
//! [`run_daily_check`] and [`run_weekly_reconcile`] directly instead of
//! spawning [`consistency_schedule_task`].
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let schedule = engine.config().schedule.clone();
//! let handle = tokio::spawn(consistency_schedule_task(engine, schedule, shutdown_rx));
//!
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use crate::engine::ConsistencyEngine;
use concord_core::{CheckMode, ScheduleConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for scheduled job activity.
#[derive(Debug, Default)]
pub struct ScheduleMetrics {
    /// Daily check cycles completed
    pub check_cycles: AtomicU64,
    /// Weekly reconcile cycles completed
    pub reconcile_cycles: AtomicU64,
    /// Per-type checks that returned a report
    pub checks_run: AtomicU64,
    /// Per-type reconciles that ran
    pub reconciles_run: AtomicU64,
    /// Keys repaired by scheduled reconciles
    pub keys_repaired: AtomicU64,
    /// Per-type runs that failed outright
    pub failures: AtomicU64,
}

impl ScheduleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            check_cycles: self.check_cycles.load(Ordering::Relaxed),
            reconcile_cycles: self.reconcile_cycles.load(Ordering::Relaxed),
            checks_run: self.checks_run.load(Ordering::Relaxed),
            reconciles_run: self.reconciles_run.load(Ordering::Relaxed),
            keys_repaired: self.keys_repaired.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ScheduleMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleSnapshot {
    pub check_cycles: u64,
    pub reconcile_cycles: u64,
    pub checks_run: u64,
    pub reconciles_run: u64,
    pub keys_repaired: u64,
    pub failures: u64,
}

// ============================================================================
// JOBS
// ============================================================================

/// Full-sweep check of every registered entity type.
pub async fn run_daily_check(engine: &ConsistencyEngine, metrics: &ScheduleMetrics) {
    let config = engine.config();
    for entity_type in engine.entity_types() {
        match engine
            .checker()
            .check(&entity_type, config.schedule.sweep_max_instances, CheckMode::FullSweep)
            .await
        {
            Ok(report) => {
                metrics.checks_run.fetch_add(1, Ordering::Relaxed);
                if !report.is_healthy(config.consistency_threshold) {
                    tracing::warn!(
                        entity_type = %entity_type,
                        ratio = report.consistency_ratio(),
                        threshold = config.consistency_threshold,
                        "Daily sweep below consistency threshold"
                    );
                }
            }
            Err(e) => {
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(entity_type = %entity_type, error = %e, "Daily sweep failed");
            }
        }
    }
    metrics.check_cycles.fetch_add(1, Ordering::Relaxed);
}

/// Full reconcile of every registered entity type.
pub async fn run_weekly_reconcile(engine: &ConsistencyEngine, metrics: &ScheduleMetrics) {
    let schedule = &engine.config().schedule;
    for entity_type in engine.entity_types() {
        match engine
            .run_reconcile(
                &entity_type,
                schedule.force_reconcile,
                schedule.sweep_batch_size,
                schedule.sweep_max_instances,
            )
            .await
        {
            Ok(result) => {
                metrics.reconciles_run.fetch_add(1, Ordering::Relaxed);
                metrics
                    .keys_repaired
                    .fetch_add(result.updated, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(entity_type = %entity_type, error = %e, "Weekly reconcile failed");
            }
        }
    }
    metrics.reconcile_cycles.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run both jobs on their intervals until `shutdown_rx` reports `true`.
///
/// The first tick of each job fires one full period after start.
pub async fn consistency_schedule_task(
    engine: ConsistencyEngine,
    config: ScheduleConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ScheduleMetrics> {
    let metrics = Arc::new(ScheduleMetrics::new());

    let start = Instant::now();
    let mut check_interval = interval_at(start + config.check_interval, config.check_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut reconcile_interval =
        interval_at(start + config.reconcile_interval, config.reconcile_interval);
    reconcile_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        force_reconcile = config.force_reconcile,
        "Consistency schedule started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also ends the task.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Consistency schedule shutting down");
                    break;
                }
            }

            _ = check_interval.tick() => {
                run_daily_check(&engine, &metrics).await;
            }

            _ = reconcile_interval.tick() => {
                run_weekly_reconcile(&engine, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        check_cycles = snapshot.check_cycles,
        reconcile_cycles = snapshot.reconcile_cycles,
        keys_repaired = snapshot.keys_repaired,
        failures = snapshot.failures,
        "Consistency schedule completed"
    );

    metrics
}
