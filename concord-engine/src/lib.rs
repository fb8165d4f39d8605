//! Concord engine: consistency checking and reconciliation between a cache
//! and its authoritative store.
//!
//! The [`ConsistencyEngine`] facade owns every collaborator. Around it:
//!
//! - [`checker`] classifies cache/store pairs into a [`ConsistencyReport`]
//! - [`reconciler`] repairs discrepancies under per-key leases
//! - [`writer`] is the application read/write path through the cache
//! - [`sampling`] fires background checks from the request path
//! - [`scheduler`] runs the daily sweep and weekly reconcile
//! - [`metrics`] exports stats to Prometheus
//!
//! [`ConsistencyReport`]: concord_core::ConsistencyReport

pub mod checker;
pub mod engine;
pub mod locking;
pub mod metrics;
pub mod parts;
pub mod reconciler;
pub mod sampling;
pub mod scheduler;
pub mod telemetry;
pub mod writer;

pub use checker::{CheckOptions, ConsistencyChecker};
pub use engine::{ConsistencyEngine, ConsistencyEngineBuilder, EngineStats, SampledOutcome};
pub use locking::acquire_with_retry;
pub use metrics::PrometheusStatsCollector;
pub use parts::EngineParts;
pub use reconciler::Reconciler;
pub use sampling::{SamplingDecision, SamplingLayer, SamplingMiddleware, SamplingService};
pub use scheduler::{
    consistency_schedule_task, run_daily_check, run_weekly_reconcile, ScheduleMetrics,
    ScheduleSnapshot,
};
pub use telemetry::{init_tracing, TelemetryConfig};
pub use writer::WriterPath;
