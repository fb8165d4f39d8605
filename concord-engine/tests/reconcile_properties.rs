//! End-to-end reconciliation behaviour against in-memory collaborators.

use chrono::{Duration as ChronoDuration, Utc};
use concord_core::{CheckMode, EngineConfig, EntityId, EntityKey, StatsCollector};
use concord_engine::ConsistencyEngine;
use concord_storage::{CacheBackend, InMemoryCacheBackend, InMemoryLockManager, InMemoryStore, LockManager};
use concord_test_utils::assertions::{assert_cache_matches_store, assert_not_cached};
use concord_test_utils::fixtures::{cache_envelope, seed_cache, seed_store, text, user};
use concord_test_utils::RecordingStatsCollector;
use std::sync::Arc;

struct Harness {
    engine: ConsistencyEngine,
    cache: Arc<InMemoryCacheBackend>,
    store: Arc<InMemoryStore>,
    stats: Arc<RecordingStatsCollector>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

fn harness_with(config: EngineConfig) -> Harness {
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
    Harness {
        engine,
        cache,
        store,
        stats,
    }
}

#[tokio::test]
async fn test_missing_entry_is_populated_with_store_version() {
    let h = harness();
    let ty = user();
    seed_store(&h.store, &ty, "1", text("A"), 7, Utc::now());

    let report = h.engine.run_check(&ty, 10).await.unwrap();
    assert_eq!(report.missing(), 1);

    let result = h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.cache_writes, 1);
    assert_eq!(result.store_writes, 0);

    let cached = h.cache.get(&ty, &"1".into()).await.unwrap().unwrap();
    assert_eq!(cached.payload, text("A"));
    assert_eq!(cached.version, Some(7));
}

#[tokio::test]
async fn test_orphan_outside_grace_is_deleted() {
    let h = harness();
    let ty = user();
    let long_ago = Utc::now() - ChronoDuration::hours(1);
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "9", text("ghost"), 1, long_ago))
        .await
        .unwrap();

    let result = h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();
    assert_eq!(result.cache_deletes, 1);
    assert_not_cached(h.cache.as_ref(), &ty, &"9".into()).await;
}

#[tokio::test]
async fn test_orphan_inside_grace_is_left_alone_unless_forced() {
    let h = harness();
    let ty = user();
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "9", text("fresh"), 1, Utc::now()))
        .await
        .unwrap();

    let report = h
        .engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    assert_eq!(report.transient(), 1);
    assert_eq!(report.orphaned(), 0);

    let result = h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();
    assert_eq!(result.total_writes(), 0);
    assert!(h.cache.contains(&ty, &"9".into()));

    let forced = h.engine.run_reconcile(&ty, true, 10, 100).await.unwrap();
    assert_eq!(forced.cache_deletes, 1);
    assert!(!h.cache.contains(&ty, &"9".into()));
}

#[tokio::test]
async fn test_orphan_found_when_store_fills_the_sweep_bound() {
    let mut config = EngineConfig::default();
    config.schedule.sweep_max_instances = 3;
    let h = harness_with(config);
    let ty = user();
    let now = Utc::now();
    for id in ["1", "2", "3"] {
        seed_store(&h.store, &ty, id, text(id), 1, now);
        seed_cache(h.cache.as_ref(), cache_envelope(&ty, id, text(id), 1, now))
            .await
            .unwrap();
    }
    let long_ago = now - ChronoDuration::hours(2);
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "9", text("ghost"), 1, long_ago))
        .await
        .unwrap();

    let report = h
        .engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    assert_eq!(report.consistent(), 3);
    assert_eq!(report.orphaned(), 1);

    let result = h.engine.run_reconcile(&ty, true, 10, 3).await.unwrap();
    assert_eq!(result.cache_deletes, 1);
    assert_not_cached(h.cache.as_ref(), &ty, &"9".into()).await;
    for id in ["1", "2", "3"] {
        assert!(h.cache.contains(&ty, &id.into()));
    }
}

#[tokio::test]
async fn test_checks_leave_cache_access_state_alone() {
    let h = harness();
    let ty = user();
    let now = Utc::now();
    for id in ["1", "2", "3"] {
        seed_store(&h.store, &ty, id, text(id), 1, now);
        seed_cache(h.cache.as_ref(), cache_envelope(&ty, id, text(id), 1, now))
            .await
            .unwrap();
    }
    seed_store(&h.store, &ty, "4", text("4"), 1, now);
    let touched = h.cache.last_access(&ty, &"1".into()).unwrap();

    let report = h.engine.run_check(&ty, 10).await.unwrap();
    assert_eq!(report.missing(), 1);
    h.engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();

    let stats = h.cache.stats().await.unwrap();
    assert_eq!((stats.hits, stats.misses), (0, 0));
    assert_eq!(h.cache.last_access(&ty, &"1".into()), Some(touched));
}

#[tokio::test]
async fn test_deleted_entity_is_orphaned_immediately() {
    let h = harness();
    let ty = user();
    let id = EntityId::new("5");
    h.engine.write(&ty, &id, text("v1")).await.unwrap();

    // A stale cache write lands after the delete.
    h.engine.delete(&ty, &id).await.unwrap();
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "5", text("v1"), 1, Utc::now()))
        .await
        .unwrap();

    let report = h
        .engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    assert_eq!(report.orphaned(), 1);

    h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();
    assert_not_cached(h.cache.as_ref(), &ty, &id).await;
}

#[tokio::test]
async fn test_newer_cache_value_is_written_to_store_at_next_version() {
    let h = harness();
    let ty = user();
    let t2 = Utc::now() - ChronoDuration::minutes(1);
    let t1 = t2 - ChronoDuration::minutes(10);
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "1", text("B"), 3, t2))
        .await
        .unwrap();
    seed_store(&h.store, &ty, "1", text("A"), 2, t1);

    let report = h.engine.run_check(&ty, 10).await.unwrap();
    assert_eq!(report.stale(), 1);

    let result = h.engine.run_reconcile(&ty, false, 10, 100).await.unwrap();
    assert_eq!(result.store_writes, 1);

    let record = h.store.record(&EntityKey::new("user", "1")).unwrap();
    assert_eq!(record.payload, text("B"));
    assert_eq!(record.version, 4);
    assert_cache_matches_store(h.cache.as_ref(), h.store.as_ref(), &ty, &"1".into()).await;
}

#[tokio::test]
async fn test_forced_reconcile_lets_store_win() {
    let h = harness();
    let ty = user();
    let now = Utc::now();
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "1", text("C"), 5, now))
        .await
        .unwrap();
    seed_store(&h.store, &ty, "1", text("A"), 2, now - ChronoDuration::hours(2));

    let result = h.engine.run_reconcile(&ty, true, 10, 100).await.unwrap();
    assert_eq!(result.cache_writes, 1);
    assert_eq!(result.store_writes, 0);

    let cached = h.cache.get(&ty, &"1".into()).await.unwrap().unwrap();
    assert_eq!(cached.payload, text("A"));
    assert_eq!(cached.version, Some(2));
    assert_eq!(h.store.put_count(), 0);
}

#[tokio::test]
async fn test_second_reconcile_of_same_report_writes_nothing() {
    let h = harness();
    let ty = user();
    let old = Utc::now() - ChronoDuration::hours(1);
    seed_store(&h.store, &ty, "1", text("A"), 1, old);
    seed_store(&h.store, &ty, "2", text("B"), 4, old);
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "2", text("stale"), 1, old - ChronoDuration::hours(1)))
        .await
        .unwrap();
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "3", text("ghost"), 1, old))
        .await
        .unwrap();

    let report = h
        .engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    assert_eq!(report.discrepancies().len(), 3);

    let first = h.engine.reconciler().reconcile(&report, false, 10, 100).await;
    assert_eq!(first.updated, 3);

    let second = h.engine.reconciler().reconcile(&report, false, 10, 100).await;
    assert_eq!(second.total_writes(), 0);
    assert_eq!(second.unchanged, 3);

    let after = h
        .engine
        .checker()
        .check(&ty, 100, CheckMode::FullSweep)
        .await
        .unwrap();
    assert_eq!(after.consistency_ratio(), 1.0);
    assert_eq!(h.stats.reconciles().len(), 2);
}

#[tokio::test]
async fn test_max_instances_bounds_the_pass() {
    let h = harness();
    let ty = user();
    for i in 0..20u64 {
        seed_store(&h.store, &ty, EntityId::from(i), text("x"), 1, Utc::now());
    }
    let result = h.engine.run_reconcile(&ty, false, 3, 5).await.unwrap();
    assert_eq!(result.updated, 5);
    assert_eq!(h.cache.len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciles_commit_at_most_one_store_write() {
    let config = EngineConfig::default();
    let cache = Arc::new(InMemoryCacheBackend::new(config.eviction.clone()));
    let store = Arc::new(InMemoryStore::new());
    let locks: Arc<dyn LockManager> = Arc::new(InMemoryLockManager::new());
    let ty = user();
    let t2 = Utc::now() - ChronoDuration::minutes(1);
    seed_cache(cache.as_ref(), cache_envelope(&ty, "1", text("B"), 3, t2))
        .await
        .unwrap();
    seed_store(&store, &ty, "1", text("A"), 2, t2 - ChronoDuration::minutes(5));

    let build = || {
        ConsistencyEngine::builder(config.clone())
            .cache(cache.clone())
            .store(store.clone())
            .locks(locks.clone())
            .entity_type("user")
            .build()
            .unwrap()
    };
    let (a, b) = (build(), build());
    assert_ne!(a.holder_id(), b.holder_id());

    let (ra, rb) = tokio::join!(
        a.run_reconcile(&ty, false, 10, 100),
        b.run_reconcile(&ty, false, 10, 100)
    );
    let total = ra.unwrap().store_writes + rb.unwrap().store_writes;
    assert!(total <= 1, "store written {} times", total);
    assert_eq!(store.put_count(), total);
    assert_eq!(
        store.record(&EntityKey::new("user", "1")).unwrap().payload,
        text("B")
    );
}

#[tokio::test]
async fn test_stats_track_rolling_ratio() {
    let h = harness();
    let ty = user();
    let now = Utc::now();
    seed_store(&h.store, &ty, "1", text("A"), 1, now);
    seed_store(&h.store, &ty, "2", text("B"), 1, now);
    seed_cache(h.cache.as_ref(), cache_envelope(&ty, "1", text("A"), 1, now))
        .await
        .unwrap();

    let report = h.engine.run_check(&ty, 10).await.unwrap();
    assert_eq!(report.consistency_ratio(), 0.5);
    assert_eq!(h.stats.consistency_ratio(&ty), Some(0.5));

    let stats = h.engine.get_stats().await.unwrap();
    assert_eq!(stats.consistency_ratios.get("user"), Some(&0.5));
    assert_eq!(stats.entry_count, 1);
    assert!(stats.memory_estimate > 0);
}
