use std::sync::Arc;

use contract_session::{
    BackendConfig, ContractState, SessionContext, SessionId, SessionResult, StoreConfig,
    TransitionMonitor, UnifiedSessionStore,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn build_context() -> SessionContext {
    let mut ctx = SessionContext::new(SessionId::generate());
    ctx.set_preference("budget", json!(1200));
    ctx.set_preference("use_case", json!("travel"));
    ctx.add_constraint(json!({"weight_kg": {"max": 1.5}}));
    ctx
}

async fn run_demo() -> SessionResult<()> {
    println!("== Contract session demo ==");
    let monitor = Arc::new(TransitionMonitor::default());
    let store = UnifiedSessionStore::from_config(BackendConfig::from_env(), StoreConfig::from_env())?
        .with_monitor(monitor.clone());

    let mut ctx = build_context();
    let id = ctx.session_id().as_str().to_owned();
    store.advance(&mut ctx, "collect_preferences")?;
    store.advance(&mut ctx, "search")?;
    ctx.record_pipeline_execution(
        "product_search",
        &json!({"status": "ok", "items": 3}),
        Some(0.18),
    );
    ctx.set_search_results(vec![json!({"sku": "TRV-13"}), json!({"sku": "TRV-14"})]);
    println!("Saved session {id}: {}", store.save(&id, &ctx).await);

    store.invalidate(&id);
    if let Some(loaded) = store.load(&id).await {
        println!(
            "Loaded state {} after {} steps",
            loaded.current_state(),
            loaded.step_log().len()
        );
    }

    ctx.select_product(Some(json!({"sku": "TRV-13"})));
    ctx.update_state(ContractState::ConfirmPurchase);
    store.save(&id, &ctx).await;

    let metrics = store.get_performance_metrics();
    println!(
        "save avg {:.3}ms, load avg {:.3}ms, hit rate {:.2}",
        metrics.save.avg_ms, metrics.load.avg_ms, metrics.cache_hit_rate
    );
    for (transition, counts) in monitor.transition_counts() {
        println!("{transition}: {} ok / {} failed", counts.success, counts.failure);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> SessionResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    run_demo().await
}
