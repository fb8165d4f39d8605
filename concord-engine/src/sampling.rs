//! Per-request probabilistic consistency sampling.
//!
//! [`SamplingMiddleware::on_request`] is cheap and never fails. When it
//! fires, the check (and any reconciliation it triggers) runs on a spawned
//! task bounded by a semaphore and a hard timeout, so the triggering request
//! never waits on it and never sees its errors.

use crate::engine::ConsistencyEngine;
use concord_core::{EntityType, SamplingConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, warn};

/// What `on_request` did.
#[derive(Debug)]
pub enum SamplingDecision {
    /// The random draw did not fire, or nothing is registered to check.
    Skipped,
    /// The chosen entity type was checked too recently.
    Throttled(EntityType),
    /// Too many checks already in flight.
    Saturated(EntityType),
    /// A background check was started.
    Dispatched {
        entity_type: EntityType,
        handle: JoinHandle<()>,
    },
}

impl SamplingDecision {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, SamplingDecision::Dispatched { .. })
    }
}

/// Request-path trigger for sampled checks.
pub struct SamplingMiddleware {
    engine: ConsistencyEngine,
    probability: f64,
    min_interval: Duration,
    sample_size: usize,
    limits: SamplingConfig,
    rng: Mutex<StdRng>,
    last_check: Mutex<HashMap<EntityType, Instant>>,
    in_flight: Arc<Semaphore>,
}

impl SamplingMiddleware {
    pub fn new(engine: ConsistencyEngine) -> Self {
        Self::with_rng(engine, StdRng::from_rng(&mut rand::rng()))
    }

    /// Use a seeded generator, for reproducible tests.
    pub fn with_seed(engine: ConsistencyEngine, seed: u64) -> Self {
        Self::with_rng(engine, StdRng::seed_from_u64(seed))
    }

    fn with_rng(engine: ConsistencyEngine, rng: StdRng) -> Self {
        let config = engine.config();
        let probability = config.check_probability;
        let min_interval = config.check_interval_per_type;
        let sample_size = config.sample_size;
        let limits = config.sampling.clone();
        Self {
            in_flight: Arc::new(Semaphore::new(limits.max_in_flight)),
            engine,
            probability,
            min_interval,
            sample_size,
            limits,
            rng: Mutex::new(rng),
            last_check: Mutex::new(HashMap::new()),
        }
    }

    /// Number of additional checks that could start right now.
    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }

    /// Decide whether this request triggers a check, and dispatch it if so.
    pub fn on_request(&self) -> SamplingDecision {
        if self.probability <= 0.0 {
            return SamplingDecision::Skipped;
        }
        let entity_types = self.engine.entity_types();
        let chosen = {
            let Ok(mut rng) = self.rng.lock() else {
                return SamplingDecision::Skipped;
            };
            if rng.random::<f64>() >= self.probability || entity_types.is_empty() {
                return SamplingDecision::Skipped;
            }
            entity_types[rng.random_range(0..entity_types.len())].clone()
        };

        // Stamp the type only once a check can start.
        let (permit, runtime) = {
            let Ok(mut last) = self.last_check.lock() else {
                return SamplingDecision::Skipped;
            };
            let now = Instant::now();
            if let Some(previous) = last.get(&chosen) {
                if now.duration_since(*previous) < self.min_interval {
                    return SamplingDecision::Throttled(chosen);
                }
            }
            let Ok(permit) = self.in_flight.clone().try_acquire_owned() else {
                debug!(entity_type = %chosen, "Sampling saturated, dropping check");
                return SamplingDecision::Saturated(chosen);
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return SamplingDecision::Skipped;
            };
            last.insert(chosen.clone(), now);
            (permit, runtime)
        };

        let engine = self.engine.clone();
        let entity_type = chosen.clone();
        let sample_size = self.sample_size;
        let timeout = self.limits.timeout;
        let handle = runtime.spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(timeout, engine.sampled_check(&entity_type, sample_size)).await {
                Ok(Ok(outcome)) => debug!(
                    entity_type = %entity_type,
                    ratio = outcome.report.consistency_ratio(),
                    reconciled = outcome.reconciliation.is_some(),
                    "Sampled check finished"
                ),
                Ok(Err(e)) => warn!(entity_type = %entity_type, error = %e, "Sampled check failed"),
                Err(_) => warn!(
                    entity_type = %entity_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "Sampled check abandoned after timeout"
                ),
            }
        });
        SamplingDecision::Dispatched {
            entity_type: chosen,
            handle,
        }
    }
}

impl std::fmt::Debug for SamplingMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingMiddleware")
            .field("probability", &self.probability)
            .field("min_interval", &self.min_interval)
            .field("available_slots", &self.available_slots())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TOWER INTEGRATION
// ============================================================================

/// Layer that runs [`SamplingMiddleware::on_request`] before every call.
#[derive(Debug, Clone)]
pub struct SamplingLayer {
    sampler: Arc<SamplingMiddleware>,
}

impl SamplingLayer {
    pub fn new(sampler: Arc<SamplingMiddleware>) -> Self {
        Self { sampler }
    }
}

impl<S> Layer<S> for SamplingLayer {
    type Service = SamplingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SamplingService {
            inner,
            sampler: self.sampler.clone(),
        }
    }
}

/// Service produced by [`SamplingLayer`].
#[derive(Debug, Clone)]
pub struct SamplingService<S> {
    inner: S,
    sampler: Arc<SamplingMiddleware>,
}

impl<S, Request> Service<Request> for SamplingService<S>
where
    S: Service<Request>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // The decision (and its task handle) is dropped: the check is detached.
        let _ = self.sampler.on_request();
        Box::pin(self.inner.call(request))
    }
}
