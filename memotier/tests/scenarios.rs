//! End-to-end pipeline scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use memotier::registry::StaticSource;
use memotier::{
    CacheKey, CacheManager, CacheOptions, MemoryCache, PolicyFragment, PolicyRegistry, Tag,
    TieredCache,
};
use memotier_backend::{BroadcastBackplane, FormatExt, MsgpackFormat};
use memotier_core::CacheValue;
use memotier_test::MockStorage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Payload {
    message: String,
}

fn payload(message: &str) -> Payload {
    Payload {
        message: message.to_string(),
    }
}

#[tokio::test]
async fn hit_after_write() {
    let cache = MemoryCache::with_defaults();
    let key = CacheKey::new("k1");

    cache.set(key.clone(), payload("hello"), Duration::from_secs(60), None, &[]);
    assert_eq!(cache.get::<Payload>(&key), Some(payload("hello")));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
}

#[tokio::test]
async fn l2_hit_warms_l1_with_clamped_ttl() {
    let l2 = MockStorage::new();
    let options = CacheOptions {
        enable_backplane: false,
        ..CacheOptions::default()
    };
    let tiers = TieredCache::builder()
        .options(options)
        .l2(l2.clone())
        .build()
        .unwrap();

    // L2 holds 42 with ten minutes remaining; L1 is empty.
    let key = CacheKey::new("k2");
    let raw = MsgpackFormat.serialize_value(&42i32).unwrap();
    let expire = chrono::Utc::now() + chrono::Duration::minutes(10);
    l2.seed(key.clone(), CacheValue::new(raw, Some(expire)), vec![]);

    assert_eq!(tiers.get::<i32>(&key).await, Some(42));

    // L1 now holds the value with a TTL no longer than the L1 ceiling.
    let (value, meta) = tiers.memory().get_with_meta::<i32>(&key).unwrap();
    assert_eq!(value, 42);
    assert!(meta.original <= tiers.options().l1_max_expiration);
    assert!(meta.remaining <= Duration::from_secs(600));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stampede_invokes_factory_exactly_once() {
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            l2_enabled: false,
            enable_backplane: false,
            ..CacheOptions::default()
        })
        .build()
        .unwrap();
    let manager = CacheManager::builder().tiers(tiers).build().unwrap();
    let invocations = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let mut callers = Vec::new();
    for _ in 0..100 {
        let manager = Arc::clone(&manager);
        let invocations = Arc::clone(&invocations);
        callers.push(tokio::spawn(async move {
            manager
                .get_or_create("k3", &[], move || async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<i32, std::io::Error>(7)
                })
                .await
        }));
    }

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), 7);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(
        started.elapsed() < Duration::from_millis(300),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn tag_invalidation_removes_exactly_the_tagged_keys() {
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            l2_enabled: false,
            enable_backplane: false,
            ..CacheOptions::default()
        })
        .build()
        .unwrap();
    let ttl = Duration::from_secs(600);

    tiers.set(&CacheKey::new("a"), &1i32, ttl, None, &[Tag::new("t")]).await;
    tiers.set(&CacheKey::new("b"), &2i32, ttl, None, &[Tag::new("t")]).await;
    tiers.set(&CacheKey::new("c"), &3i32, ttl, None, &[Tag::new("other")]).await;

    tiers.remove_by_tag(&Tag::new("t")).await;

    assert_eq!(tiers.get::<i32>(&CacheKey::new("a")).await, None);
    assert_eq!(tiers.get::<i32>(&CacheKey::new("b")).await, None);
    assert_eq!(tiers.get::<i32>(&CacheKey::new("c")).await, Some(3));
}

#[tokio::test]
async fn runtime_override_wins_and_tags_union() {
    let registry = PolicyRegistry::builder()
        .source(StaticSource::attributes().method(
            "m",
            PolicyFragment::new()
                .duration(Duration::from_secs(60))
                .tags(["x"]),
        ))
        .build()
        .unwrap();

    registry
        .apply_override("m", PolicyFragment::new().duration(Duration::from_secs(5)))
        .unwrap();

    let resolution = registry.get_policy("m").unwrap();
    assert_eq!(resolution.policy.duration, Some(Duration::from_secs(5)));
    assert_eq!(resolution.policy.tags, vec![Tag::new("x")]);

    let sources: Vec<&str> = resolution
        .contributions
        .iter()
        .map(|c| c.source_id.as_str())
        .collect();
    assert_eq!(sources, ["attributes", "runtime-overrides"]);
    assert!(
        resolution.contributions.windows(2).all(|w| w[0].priority <= w[1].priority),
        "contributions must be in ascending priority order"
    );
}

#[tokio::test]
async fn cross_instance_tag_invalidation_touches_remote_l1_only() {
    // Two instances sharing one distributed store and one backplane.
    let shared_l2 = MockStorage::new();
    let backplane_one = BroadcastBackplane::with_instance_id("i1");
    let backplane_two = backplane_one.join("i2");

    let instance = |id: &str, backplane: BroadcastBackplane| {
        TieredCache::builder()
            .options(CacheOptions {
                instance_id: id.into(),
                ..CacheOptions::default()
            })
            .l2(shared_l2.clone())
            .backplane(backplane)
            .build()
            .unwrap()
    };
    let one = instance("i1", backplane_one);
    let two = instance("i2", backplane_two);

    let key = CacheKey::new("k");
    one.set(&key, &payload("v"), Duration::from_secs(3600), None, &[Tag::new("t")])
        .await;

    // Instance two reads through L2 and warms its own L1 (tags included).
    assert_eq!(two.get::<Payload>(&key).await, Some(payload("v")));
    assert_eq!(two.memory().peek::<Payload>(&key), Some(payload("v")));

    let l2_reads_before = shared_l2.counters().read_count();
    one.remove_by_tag(&Tag::new("t")).await;

    // Within backplane lag the remote L1 copy disappears.
    let mut gone = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if two.memory().peek::<Payload>(&key).is_none() {
            gone = true;
            break;
        }
    }
    assert!(gone, "backplane invalidation did not reach instance two");

    // Only L1 was touched at instance two: it issued no extra L2 reads.
    assert_eq!(shared_l2.counters().read_count(), l2_reads_before);
    assert_eq!(two.get::<Payload>(&key).await, None);
}
