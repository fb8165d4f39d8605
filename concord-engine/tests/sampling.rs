//! Request-path sampling and its tower layer.

use chrono::Utc;
use concord_core::EngineConfig;
use concord_engine::{ConsistencyEngine, SamplingDecision, SamplingLayer, SamplingMiddleware};
use concord_storage::{InMemoryCacheBackend, InMemoryStore};
use concord_test_utils::assertions::assert_cache_matches_store;
use concord_test_utils::fixtures::{eager_config, seed_store, text, user};
use concord_test_utils::{FlakyCache, RecordingStatsCollector};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};

fn engine(
    config: EngineConfig,
) -> (
    ConsistencyEngine,
    Arc<InMemoryCacheBackend>,
    Arc<InMemoryStore>,
    Arc<RecordingStatsCollector>,
) {
    let cache = Arc::new(InMemoryCacheBackend::new(config.eviction.clone()));
    let store = Arc::new(InMemoryStore::new());
    let stats = Arc::new(RecordingStatsCollector::new());
    let engine = ConsistencyEngine::builder(config)
        .cache(cache.clone())
        .store(store.clone())
        .stats(stats.clone())
        .entity_type("user")
        .build()
        .unwrap();
    (engine, cache, store, stats)
}

#[tokio::test]
async fn test_zero_probability_never_dispatches() {
    let (engine, _, store, stats) = engine(eager_config().with_check_probability(0.0));
    seed_store(&store, &user(), "1", text("A"), 1, Utc::now());
    let sampler = SamplingMiddleware::with_seed(engine, 7);

    for _ in 0..10_000 {
        assert!(matches!(sampler.on_request(), SamplingDecision::Skipped));
    }
    tokio::task::yield_now().await;
    assert_eq!(stats.check_count(), 0);
}

#[tokio::test]
async fn test_no_registered_types_skips() {
    let config = eager_config();
    let engine = ConsistencyEngine::builder(config)
        .in_memory_cache()
        .store(Arc::new(InMemoryStore::new()))
        .build()
        .unwrap();
    let sampler = SamplingMiddleware::with_seed(engine, 1);
    assert!(matches!(sampler.on_request(), SamplingDecision::Skipped));
}

#[tokio::test]
async fn test_low_ratio_triggers_reconcile_in_background() {
    let (engine, cache, store, stats) = engine(eager_config());
    let ty = user();
    for id in ["1", "2", "3"] {
        seed_store(&store, &ty, id, text(id), 2, Utc::now());
    }
    let sampler = SamplingMiddleware::with_seed(engine, 42);

    let SamplingDecision::Dispatched { entity_type, handle } = sampler.on_request() else {
        panic!("expected a dispatched check");
    };
    assert_eq!(entity_type, ty);
    handle.await.unwrap();

    let checks = stats.checks();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].missing(), 3);
    assert_eq!(stats.reconciles().len(), 1);
    for id in ["1", "2", "3"] {
        assert_cache_matches_store(cache.as_ref(), store.as_ref(), &ty, &id.into()).await;
    }
}

#[tokio::test]
async fn test_healthy_sample_does_not_reconcile() {
    let (engine, _, _, stats) = engine(eager_config());
    let sampler = SamplingMiddleware::with_seed(engine, 42);

    let SamplingDecision::Dispatched { handle, .. } = sampler.on_request() else {
        panic!("expected a dispatched check");
    };
    handle.await.unwrap();
    assert_eq!(stats.check_count(), 1);
    assert!(stats.reconciles().is_empty());
}

#[tokio::test]
async fn test_per_type_interval_throttles() {
    let mut config = eager_config();
    config.check_interval_per_type = Duration::from_secs(3600);
    let (engine, _, _, _) = engine(config);
    let sampler = SamplingMiddleware::with_seed(engine, 3);

    let first = sampler.on_request();
    assert!(first.is_dispatched());
    assert!(matches!(sampler.on_request(), SamplingDecision::Throttled(_)));
    if let SamplingDecision::Dispatched { handle, .. } = first {
        handle.await.unwrap();
    }
}

#[test]
fn test_request_without_runtime_does_not_throttle_the_type() {
    let mut config = eager_config();
    config.check_interval_per_type = Duration::from_secs(3600);
    let (engine, _, _, stats) = engine(config);
    let sampler = SamplingMiddleware::with_seed(engine, 5);

    assert!(matches!(sampler.on_request(), SamplingDecision::Skipped));
    assert_eq!(sampler.available_slots(), eager_config().sampling.max_in_flight);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let SamplingDecision::Dispatched { handle, .. } = sampler.on_request() else {
            panic!("expected a dispatched check");
        };
        handle.await.unwrap();
        assert!(matches!(sampler.on_request(), SamplingDecision::Throttled(_)));
    });
    assert_eq!(stats.check_count(), 1);
}

#[tokio::test]
async fn test_check_failure_is_not_surfaced() {
    let config = eager_config();
    let cache = Arc::new(FlakyCache::in_memory());
    let stats = Arc::new(RecordingStatsCollector::new());
    let engine = ConsistencyEngine::builder(config)
        .cache(cache.clone())
        .store(Arc::new(InMemoryStore::new()))
        .stats(stats.clone())
        .entity_type("user")
        .build()
        .unwrap();
    cache.set_down(true);
    let sampler = SamplingMiddleware::with_seed(engine, 11);

    let SamplingDecision::Dispatched { handle, .. } = sampler.on_request() else {
        panic!("expected a dispatched check");
    };
    assert!(handle.await.is_ok());
    assert_eq!(stats.check_count(), 0);
    assert_eq!(sampler.available_slots(), eager_config().sampling.max_in_flight);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_layer_samples_without_touching_responses() {
    let (engine, _, _, stats) = engine(eager_config());
    let sampler = Arc::new(SamplingMiddleware::new(engine));
    let service = SamplingLayer::new(sampler)
        .layer(service_fn(|request: u32| async move { Ok::<_, Infallible>(request * 2) }));

    let response = service.oneshot(21).await.unwrap();
    assert_eq!(response, 42);

    for _ in 0..100 {
        if stats.check_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stats.check_count(), 1);
}
