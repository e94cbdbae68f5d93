#![cfg(feature = "redis")]

mod common;

use common::shopping_context;
use contract_session::redis_store::RedisBackingStore;
use contract_session::{BackingStore, StoreConfig, UnifiedSessionStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn redis_store() -> Option<RedisBackingStore> {
    let url = std::env::var("REDIS_URL").ok()?;
    let namespace = format!("contract:session:test:{}", Uuid::new_v4());
    RedisBackingStore::from_url_with_namespace(url, namespace).ok()
}

#[tokio::test]
async fn redis_round_trip_through_store() {
    let Some(backend) = redis_store() else {
        eprintln!("Skipping redis_round_trip_through_store - REDIS_URL not set or invalid");
        return;
    };
    let store = UnifiedSessionStore::new(Arc::new(backend), StoreConfig::default());
    let id = format!("redis-{}", Uuid::new_v4());
    let mut ctx = shopping_context(&id);
    ctx.set_preference("colour", json!("silver"));

    assert!(store.save(&id, &ctx).await);
    store.clear_cache();
    assert_eq!(store.load(&id).await, Some(ctx));
}

#[tokio::test]
async fn redis_missing_key_reads_none() {
    let Some(backend) = redis_store() else {
        eprintln!("Skipping redis_missing_key_reads_none - REDIS_URL not set or invalid");
        return;
    };
    let missing = backend
        .atomic_read(&format!("missing-{}", Uuid::new_v4()))
        .await
        .expect("read succeeds");
    assert!(missing.is_none());
}

#[tokio::test]
async fn redis_retention_expires_records() {
    let Some(backend) = redis_store() else {
        eprintln!("Skipping redis_retention_expires_records - REDIS_URL not set or invalid");
        return;
    };
    let backend = backend.with_retention(Some(Duration::from_millis(200)));
    let id = format!("retained-{}", Uuid::new_v4());
    backend
        .atomic_write(&id, &json!({"session_id": &id, "current_state": "start"}))
        .await
        .expect("write succeeds");
    assert!(backend.atomic_read(&id).await.expect("read").is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(backend.atomic_read(&id).await.expect("read").is_none());
}

#[tokio::test]
async fn redis_store_serves_many_calls_on_one_connection() {
    let Some(backend) = redis_store() else {
        eprintln!("Skipping redis_store_serves_many_calls_on_one_connection - REDIS_URL not set or invalid");
        return;
    };
    let backend = Arc::new(backend);
    let mut tasks = Vec::new();
    for i in 0..32 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            let id = format!("shared-{i}");
            let record = json!({"session_id": &id, "current_state": "search", "budget": 0.1 + i as f64});
            backend.atomic_write(&id, &record).await.expect("write succeeds");
            let read = backend.atomic_read(&id).await.expect("read succeeds");
            assert_eq!(read, Some(record));
        }));
    }
    for task in tasks {
        task.await.expect("task completes");
    }
}
