use std::time::Duration;

use kestrel_core::traits::CacheBackend;
use kestrel_db::PgCacheBackend;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn set_then_get_returns_value_and_remaining_ttl() {
    let (pool, _container) = setup_test_db().await;
    let cache = PgCacheBackend::new(pool);

    cache
        .set("k:simple", "{\"title\":\"a\"}".into(), Duration::from_secs(60))
        .await
        .unwrap();

    let hit = cache.get("k:simple").await.unwrap().expect("cached");
    assert_eq!(hit.value, "{\"title\":\"a\"}");
    assert!(hit.ttl_remaining <= Duration::from_secs(60));
    assert!(hit.ttl_remaining > Duration::from_secs(50));
}

#[tokio::test]
async fn set_overwrites_existing_key() {
    let (pool, _container) = setup_test_db().await;
    let cache = PgCacheBackend::new(pool);

    cache.set("k", "old".into(), Duration::from_secs(60)).await.unwrap();
    cache.set("k", "new".into(), Duration::from_secs(60)).await.unwrap();

    assert_eq!(cache.get("k").await.unwrap().unwrap().value, "new");
}

#[tokio::test]
async fn missing_key_is_a_miss() {
    let (pool, _container) = setup_test_db().await;
    let cache = PgCacheBackend::new(pool);

    assert!(cache.get("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn expired_rows_miss_and_are_deleted() {
    let (pool, _container) = setup_test_db().await;
    let cache = PgCacheBackend::new(pool.clone());

    cache.set("short", "v".into(), Duration::from_millis(200)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(cache.get("short").await.unwrap().is_none());

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scrape_cache")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn purge_expired_keeps_live_rows() {
    let (pool, _container) = setup_test_db().await;
    let cache = PgCacheBackend::new(pool);

    cache.set("live", "v".into(), Duration::from_secs(60)).await.unwrap();
    cache.set("dead-1", "v".into(), Duration::from_millis(100)).await.unwrap();
    cache.set("dead-2", "v".into(), Duration::from_millis(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(cache.purge_expired().await.unwrap(), 2);
    assert!(cache.get("live").await.unwrap().is_some());
}
