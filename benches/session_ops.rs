use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use contract_session::inmemory::InMemoryBackingStore;
use contract_session::{
    ContractState, SessionContext, SessionId, StoreConfig, UnifiedSessionStore,
};
use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use tokio::runtime::Runtime;

fn bench_context(id: &str) -> SessionContext {
    let mut ctx = SessionContext::new(SessionId::new(id).expect("bench id"));
    ctx.set_preference("budget", json!(1500));
    ctx.set_preference("brand", json!("any"));
    ctx.add_constraint(json!({"ram_gb": {"min": 16}}));
    ctx.update_state(ContractState::Search);
    ctx.record_pipeline_execution(
        "product_search",
        &json!({"status": "ok", "items": 12}),
        Some(0.25),
    );
    ctx.set_search_results(vec![json!({"sku": "LT-1"}), json!({"sku": "LT-2"})]);
    ctx
}

fn store() -> UnifiedSessionStore {
    UnifiedSessionStore::new(
        Arc::new(InMemoryBackingStore::new()),
        StoreConfig::default(),
    )
}

fn context_benches(c: &mut Criterion) {
    let ctx = bench_context("bench-serialize");
    let record = ctx
        .serialize()
        .expect("serialize")
        .to_value()
        .expect("encode");

    c.bench_function("context_serialize", |b| {
        b.iter(|| black_box(ctx.serialize().expect("serialize")));
    });

    c.bench_function("context_deserialize", |b| {
        b.iter(|| black_box(SessionContext::deserialize(&record).expect("deserialize")));
    });
}

fn store_benches(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let store = store();

    c.bench_function("unified_save", |b| {
        let counter = AtomicU64::new(0);
        b.to_async(&rt).iter(|| {
            let bucket = counter.fetch_add(1, Ordering::Relaxed) % 16;
            let id = format!("bench-save-{bucket}");
            let ctx = bench_context(&id);
            let store = &store;
            async move { black_box(store.save(&id, &ctx).await) }
        });
    });

    c.bench_function("unified_load_cached", |b| {
        rt.block_on(store.save("bench-load", &bench_context("bench-load")));
        b.to_async(&rt)
            .iter(|| async { black_box(store.load("bench-load").await) });
    });

    c.bench_function("unified_load_backing", |b| {
        rt.block_on(store.save("bench-cold", &bench_context("bench-cold")));
        b.to_async(&rt).iter(|| async {
            store.invalidate("bench-cold");
            black_box(store.load("bench-cold").await)
        });
    });
}

criterion_group!(session_ops, context_benches, store_benches);
criterion_main!(session_ops);
