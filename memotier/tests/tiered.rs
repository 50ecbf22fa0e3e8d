//! Coordinator behavior: layer failures, clamping, async writes,
//! backplane loopback, health, stats.

use std::time::Duration;

use memotier::{CacheKey, CacheOptions, HealthStatus, Tag, TieredCache};
use memotier_backend::{
    Backplane, BroadcastBackplane, FormatExt, MsgpackFormat, Storage, StorageProvider,
};
use memotier_core::{CacheValue, Raw};
use memotier_test::{MockPersistentStorage, MockStorage};

fn options() -> CacheOptions {
    CacheOptions {
        enable_backplane: false,
        ..CacheOptions::default()
    }
}

#[tokio::test]
async fn failing_l2_read_degrades_to_a_miss() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    tiers.set(&CacheKey::new("k"), &1i32, Duration::from_secs(60), None, &[]).await;
    tiers.memory().clear();
    l2.fail_reads(true);

    assert_eq!(tiers.get::<i32>(&CacheKey::new("k")).await, None);

    // The failure is counted against the layer.
    let stats = tiers.stats().await;
    let l2_stats = &stats.layers[1];
    assert!(l2_stats.errors >= 1);
}

#[tokio::test]
async fn failing_l2_write_does_not_fail_the_set() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();
    l2.fail_writes(true);

    tiers.set(&CacheKey::new("k"), &1i32, Duration::from_secs(60), None, &[]).await;

    // L1 still took the write.
    assert_eq!(tiers.memory().peek::<i32>(&CacheKey::new("k")), Some(1));
    assert_eq!(l2.entry_count(), 0);
}

#[tokio::test]
async fn very_long_ttls_are_clamped_for_l1_only() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    let key = CacheKey::new("k");
    tiers.set(&key, &1i32, Duration::from_secs(48 * 3600), None, &[]).await;

    let (_, meta) = tiers.memory().get_with_meta::<i32>(&key).unwrap();
    assert!(meta.original <= tiers.options().l1_max_expiration);

    // The L2 twin keeps the full TTL.
    let (value, _) = l2.get::<i32>(&key).await.unwrap().unwrap();
    assert!(value.ttl().unwrap() > Duration::from_secs(40 * 3600));
}

#[tokio::test]
async fn short_ttls_pass_through_unclamped() {
    let tiers = TieredCache::builder().options(options()).build().unwrap();
    let key = CacheKey::new("k");
    tiers.set(&key, &1i32, Duration::from_secs(30), None, &[]).await;

    let (_, meta) = tiers.memory().get_with_meta::<i32>(&key).unwrap();
    assert!(meta.original <= Duration::from_secs(30));
}

#[tokio::test]
async fn async_l2_writes_land_in_the_background() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            enable_async_l2_writes: true,
            ..options()
        })
        .l2(l2.clone())
        .build()
        .unwrap();

    tiers.set(&CacheKey::new("k"), &7i32, Duration::from_secs(60), None, &[]).await;

    // L1 is written synchronously.
    assert_eq!(tiers.memory().peek::<i32>(&CacheKey::new("k")), Some(7));

    tiers.offload().wait_all().await;
    assert_eq!(l2.counters().write_count(), 1);
    let (value, _) = l2.get::<i32>(&CacheKey::new("k")).await.unwrap().unwrap();
    assert_eq!(value.into_inner(), 7);
}

#[tokio::test]
async fn l3_hit_warms_both_upper_tiers() {
    let l2 = MockStorage::new();
    let l3 = MockPersistentStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .l3(l3.clone())
        .build()
        .unwrap();

    // Only the durable tier holds the value.
    let key = CacheKey::new("cold");
    let raw = MsgpackFormat.serialize_value(&"archived".to_string()).unwrap();
    let expire = chrono::Utc::now() + chrono::Duration::hours(1);
    l3.inner()
        .seed(key.clone(), CacheValue::new(raw, Some(expire)), vec![Tag::new("t")]);

    assert_eq!(
        tiers.get::<String>(&key).await,
        Some("archived".to_string())
    );

    // Both upper tiers were warmed, tags preserved.
    assert_eq!(tiers.memory().peek::<String>(&key), Some("archived".to_string()));
    assert!(l2.exists(&key).await.unwrap());
    assert_eq!(l2.remove_by_tag(&Tag::new("t")).await.unwrap(), 1);
}

#[tokio::test]
async fn corrupt_l2_entries_are_evicted_and_read_as_misses() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    // 0xc1 is reserved in MessagePack and never decodes.
    let key = CacheKey::new("corrupt");
    let expire = chrono::Utc::now() + chrono::Duration::minutes(10);
    l2.seed(
        key.clone(),
        CacheValue::new(Raw::from_static(&[0xc1, 0x00]), Some(expire)),
        vec![],
    );

    assert_eq!(tiers.get::<i32>(&key).await, None);
    assert_eq!(l2.entry_count(), 0, "corrupt entry should be evicted");
}

#[tokio::test]
async fn expired_l2_entries_read_as_misses() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    let key = CacheKey::new("stale");
    let raw = MsgpackFormat.serialize_value(&1i32).unwrap();
    let expire = chrono::Utc::now() - chrono::Duration::minutes(1);
    l2.seed(key.clone(), CacheValue::new(raw, Some(expire)), vec![]);

    assert_eq!(tiers.get::<i32>(&key).await, None);
}

#[tokio::test]
async fn health_aggregates_worst_case() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    assert_eq!(tiers.health().await, HealthStatus::Healthy);
    l2.set_health(HealthStatus::Degraded);
    assert_eq!(tiers.health().await, HealthStatus::Degraded);
    l2.set_health(HealthStatus::Unhealthy);
    assert_eq!(tiers.health().await, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn stats_expose_layers_and_totals() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(options())
        .l2(l2.clone())
        .build()
        .unwrap();

    let key = CacheKey::new("k");
    tiers.set(&key, &1i32, Duration::from_secs(60), None, &[]).await;
    tiers.get::<i32>(&key).await;

    let stats = tiers.stats().await;
    assert_eq!(stats.layers.len(), 2);
    assert_eq!(stats.layers[0].name, "memory");
    assert_eq!(stats.layers[0].hits, 1);
    assert_eq!(stats.layers[1].name, "mock");
    assert_eq!(stats.total.sets, stats.layers[0].sets + stats.layers[1].sets);
    assert!(stats.layers[0].memory_bytes.is_some());
}

#[tokio::test]
async fn remove_publishes_key_invalidation() {
    let backplane = BroadcastBackplane::with_instance_id("i1");
    let mut inbox = backplane.subscribe();
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            instance_id: "i1".into(),
            l2_enabled: false,
            ..CacheOptions::default()
        })
        .backplane(backplane)
        .build()
        .unwrap();

    tiers.remove(&CacheKey::new("k")).await;

    let message = inbox.recv().await.unwrap();
    assert_eq!(message.origin, "i1");
}

#[tokio::test]
async fn self_published_invalidations_are_ignored_locally() {
    let backplane = BroadcastBackplane::with_instance_id("i1");
    let publisher = backplane.join("i1");
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            instance_id: "i1".into(),
            l2_enabled: false,
            ..CacheOptions::default()
        })
        .backplane(backplane)
        .build()
        .unwrap();

    let key = CacheKey::new("k");
    tiers.set(&key, &1i32, Duration::from_secs(600), None, &[]).await;

    // A message carrying our own origin must not remove the local entry.
    publisher.publish_invalidation(&key).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tiers.memory().peek::<i32>(&key), Some(1));

    // The same message from another origin does remove it.
    let other = publisher.join("i2");
    other.publish_invalidation(&key).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tiers.memory().peek::<i32>(&key), None);
}

#[tokio::test]
async fn shutdown_drains_and_is_idempotent() {
    let l2 = MockStorage::new();
    let tiers = TieredCache::builder()
        .options(CacheOptions {
            enable_async_l2_writes: true,
            ..options()
        })
        .l2(l2.clone())
        .build()
        .unwrap();

    tiers.set(&CacheKey::new("k"), &1i32, Duration::from_secs(60), None, &[]).await;
    tiers.shutdown().await;
    tiers.shutdown().await;

    assert!(tiers.is_disposed());
    // The pending background write drained before listeners stopped.
    assert_eq!(l2.counters().write_count(), 1);
}
