//! Manager-level behavior: single-flight, failures, locking,
//! refresh-ahead, invalidation surfaces, shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use memotier::lock::{DistributedLock, InProcessLock};
use memotier::registry::StaticSource;
use memotier::{
    CacheArg, CacheError, CacheKey, CacheManager, CacheOptions, KeyGenerator, LockBehavior,
    LockOptions, PolicyFragment, PolicyRegistry, StampedeOptions, Tag, TieredCache,
};
use memotier_test::MockStorage;

fn local_options() -> CacheOptions {
    CacheOptions {
        l2_enabled: false,
        enable_backplane: false,
        ..CacheOptions::default()
    }
}

fn manager(registry: PolicyRegistry) -> Arc<CacheManager> {
    let tiers = TieredCache::builder().options(local_options()).build().unwrap();
    CacheManager::builder()
        .tiers(tiers)
        .registry(registry)
        .build()
        .unwrap()
}

fn counting_factory(
    invocations: &Arc<AtomicUsize>,
    value: i32,
) -> impl FnOnce() -> std::future::Ready<Result<i32, std::io::Error>> + Send + 'static {
    let invocations = Arc::clone(invocations);
    move || {
        invocations.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(value))
    }
}

#[tokio::test]
async fn second_call_is_served_from_cache() {
    let manager = manager(PolicyRegistry::empty());
    let invocations = Arc::new(AtomicUsize::new(0));

    let first = manager
        .get_or_create("m", &[CacheArg::from(1i64)], counting_factory(&invocations, 10))
        .await
        .unwrap();
    let second = manager
        .get_or_create("m", &[CacheArg::from(1i64)], counting_factory(&invocations, 99))
        .await
        .unwrap();

    assert_eq!(first, 10);
    assert_eq!(second, 10);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_args_produce_different_entries() {
    let manager = manager(PolicyRegistry::empty());
    let invocations = Arc::new(AtomicUsize::new(0));

    let one = manager
        .get_or_create("m", &[CacheArg::from(1i64)], counting_factory(&invocations, 1))
        .await
        .unwrap();
    let two = manager
        .get_or_create("m", &[CacheArg::from(2i64)], counting_factory(&invocations, 2))
        .await
        .unwrap();

    assert_eq!((one, two), (1, 2));
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn factory_failure_propagates_and_is_not_cached() {
    let manager = manager(PolicyRegistry::empty());

    let failed = manager
        .get_or_create("m", &[], || async {
            Err::<i32, _>(std::io::Error::other("upstream down"))
        })
        .await;
    match failed {
        Err(CacheError::Factory(error)) => assert!(error.to_string().contains("upstream down")),
        other => panic!("expected factory failure, got {other:?}"),
    }

    // The failure was not cached; the next call re-enters the factory.
    let recovered = manager
        .get_or_create("m", &[], || async { Ok::<i32, std::io::Error>(5) })
        .await
        .unwrap();
    assert_eq!(recovered, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_share_the_factory_failure() {
    let manager = manager(PolicyRegistry::empty());
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut callers = Vec::new();
    for _ in 0..5 {
        let manager = Arc::clone(&manager);
        let invocations = Arc::clone(&invocations);
        callers.push(tokio::spawn(async move {
            manager
                .get_or_create("m", &[], move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<i32, _>(std::io::Error::other("boom"))
                })
                .await
        }));
    }

    for caller in callers {
        assert!(matches!(
            caller.await.unwrap(),
            Err(CacheError::Factory(_))
        ));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn slow_factory_hits_the_stampede_deadline() {
    let registry = PolicyRegistry::builder()
        .source(StaticSource::attributes().method(
            "slow",
            PolicyFragment::new().stampede(StampedeOptions {
                timeout: Duration::from_millis(50),
                max_concurrent_builds: 1,
            }),
        ))
        .build()
        .unwrap();
    let manager = manager(registry);

    let result = manager
        .get_or_create("slow", &[], || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<i32, std::io::Error>(0)
        })
        .await;
    assert!(matches!(result, Err(CacheError::StampedeTimeout(_))));
}

fn lock_policy(on_unavailable: LockBehavior) -> PolicyFragment {
    PolicyFragment::new().lock(LockOptions {
        wait: Duration::from_millis(50),
        on_unavailable,
        ..LockOptions::default()
    })
}

#[tokio::test]
async fn contended_lock_falls_back_to_direct_factory_without_caching() {
    let registry = PolicyRegistry::builder()
        .source(
            StaticSource::attributes()
                .method("locked", lock_policy(LockBehavior::FallbackDirect)),
        )
        .build()
        .unwrap();
    let lock = Arc::new(InProcessLock::new());
    let tiers = TieredCache::builder().options(local_options()).build().unwrap();
    let manager = CacheManager::builder()
        .tiers(Arc::clone(&tiers))
        .registry(registry)
        .lock(Arc::clone(&lock))
        .build()
        .unwrap();

    // Hold the lock the manager will want.
    let key = manager
        .registry()
        .get_policy("locked")
        .map(|resolution| {
            memotier::FastKeyGenerator::default().generate("locked", &[], &resolution.policy)
        })
        .unwrap();
    let lock_key = CacheKey::new(format!("lock:{key}"));
    let _lease = lock
        .acquire(&lock_key, &LockOptions::default())
        .await
        .unwrap()
        .unwrap();

    let value = manager
        .get_or_create("locked", &[], || async { Ok::<i32, std::io::Error>(3) })
        .await
        .unwrap();
    assert_eq!(value, 3);
    // Stampede fallback: computed but not cached.
    assert_eq!(tiers.memory().peek::<i32>(&key), None);
}

#[tokio::test]
async fn contended_lock_fails_when_the_policy_forbids_fallback() {
    let registry = PolicyRegistry::builder()
        .source(StaticSource::attributes().method("locked", lock_policy(LockBehavior::Fail)))
        .build()
        .unwrap();
    let lock = Arc::new(InProcessLock::new());
    let tiers = TieredCache::builder().options(local_options()).build().unwrap();
    let manager = CacheManager::builder()
        .tiers(tiers)
        .registry(registry)
        .lock(Arc::clone(&lock))
        .build()
        .unwrap();

    let key = manager
        .registry()
        .get_policy("locked")
        .map(|resolution| {
            memotier::FastKeyGenerator::default().generate("locked", &[], &resolution.policy)
        })
        .unwrap();
    let _lease = lock
        .acquire(&CacheKey::new(format!("lock:{key}")), &LockOptions::default())
        .await
        .unwrap()
        .unwrap();

    let result = manager
        .get_or_create("locked", &[], || async { Ok::<i32, std::io::Error>(3) })
        .await;
    assert!(matches!(result, Err(CacheError::LockUnavailable { .. })));
}

#[tokio::test]
async fn refresh_ahead_recomputes_in_the_background() {
    let registry = PolicyRegistry::builder()
        .source(StaticSource::attributes().method(
            "fresh",
            PolicyFragment::new()
                .duration(Duration::from_millis(1000))
                .refresh_ahead(0.5),
        ))
        .build()
        .unwrap();
    let tiers = TieredCache::builder().options(local_options()).build().unwrap();
    let manager = CacheManager::builder()
        .tiers(Arc::clone(&tiers))
        .registry(registry)
        .build()
        .unwrap();

    let first = manager
        .get_or_create("fresh", &[], || async { Ok::<i32, std::io::Error>(1) })
        .await
        .unwrap();
    assert_eq!(first, 1);

    // Age the entry past the refresh threshold.
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Still fresh, so the caller gets the old value synchronously while
    // the refresh runs in the background with the new factory.
    let second = manager
        .get_or_create("fresh", &[], || async { Ok::<i32, std::io::Error>(2) })
        .await
        .unwrap();
    assert_eq!(second, 1);

    tiers.offload().wait_all().await;
    let refreshed = manager
        .get_or_create("fresh", &[], || async { Ok::<i32, std::io::Error>(3) })
        .await
        .unwrap();
    assert_eq!(refreshed, 2, "background refresh should have stored 2");
}

#[tokio::test]
async fn raw_key_argument_is_used_verbatim() {
    let manager = manager(PolicyRegistry::empty());
    let value = manager
        .get_or_create("m", &[CacheArg::raw_key("tenant-1:conf")], || async {
            Ok::<i32, std::io::Error>(11)
        })
        .await
        .unwrap();
    assert_eq!(value, 11);
    assert_eq!(
        manager.try_get_fast::<i32>(&CacheKey::new("tenant-1:conf")).await,
        Some(11)
    );
}

#[tokio::test]
async fn try_get_never_invokes_anything() {
    let manager = manager(PolicyRegistry::empty());
    let missing: Option<i32> = manager.try_get("m", &[]).await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn pattern_invalidation_matches_globs() {
    let manager = manager(PolicyRegistry::empty());
    for name in ["users:1", "users:2", "orders:1"] {
        manager
            .get_or_create("m", &[CacheArg::raw_key(name)], || async {
                Ok::<i32, std::io::Error>(1)
            })
            .await
            .unwrap();
    }

    manager.invalidate_by_pattern("users:*").await;

    assert_eq!(manager.try_get_fast::<i32>(&CacheKey::new("users:1")).await, None);
    assert_eq!(manager.try_get_fast::<i32>(&CacheKey::new("users:2")).await, None);
    assert_eq!(
        manager.try_get_fast::<i32>(&CacheKey::new("orders:1")).await,
        Some(1)
    );
}

#[tokio::test]
async fn invalidation_by_keys_and_tags_goes_through_every_tier() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            enable_backplane: false,
            ..CacheOptions::default()
        })
        .l2(l2.clone())
        .build()
        .unwrap();
    let manager = CacheManager::builder().tiers(tiers).build().unwrap();

    manager
        .get_or_create("m", &[CacheArg::raw_key("a")], || async {
            Ok::<i32, std::io::Error>(1)
        })
        .await
        .unwrap();
    assert_eq!(l2.counters().write_count(), 1);

    manager.invalidate_by_keys(&[CacheKey::new("a")]).await;
    assert_eq!(manager.try_get_fast::<i32>(&CacheKey::new("a")).await, None);
    assert_eq!(l2.entry_count(), 0);

    manager.invalidate_by_tags(&[Tag::new("unknown")]).await;
}

#[tokio::test]
async fn callbacks_fire_on_hit_and_miss() {
    let hits = Arc::new(AtomicUsize::new(0));
    let misses = Arc::new(AtomicUsize::new(0));
    let tiers = TieredCache::builder().options(local_options()).build().unwrap();
    let manager = {
        let hits = Arc::clone(&hits);
        let misses = Arc::clone(&misses);
        CacheManager::builder()
            .tiers(tiers)
            .on_hit(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .on_miss(move |_| {
                misses.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap()
    };

    let factory = || async { Ok::<i32, std::io::Error>(1) };
    manager.get_or_create("m", &[], factory).await.unwrap();
    manager.get_or_create("m", &[], factory).await.unwrap();

    assert_eq!(misses.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_rejects_new_operations() {
    let manager = manager(PolicyRegistry::empty());
    manager.shutdown().await;

    let result = manager
        .get_or_create("m", &[], || async { Ok::<i32, std::io::Error>(1) })
        .await;
    assert!(matches!(result, Err(CacheError::ShuttingDown)));
    assert!(matches!(
        manager.try_get::<i32>("m", &[]).await,
        Err(CacheError::ShuttingDown)
    ));
}
