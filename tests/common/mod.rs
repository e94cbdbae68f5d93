#![allow(dead_code)]

use async_trait::async_trait;
use contract_session::inmemory::InMemoryBackingStore;
use contract_session::{BackingStore, ContractState, SessionContext, SessionId, SessionResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory backend that counts calls and can be slowed down.
#[derive(Default)]
pub struct ProbeBackend {
    pub inner: InMemoryBackingStore,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub delay: parking_lot::Mutex<Option<Duration>>,
    pub stall_after_read: parking_lot::Mutex<Option<Duration>>,
}

impl ProbeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Reads return their record only after `stall` has passed, so writes can land between
    /// the fetch and its delivery.
    pub fn stall_reads(&self, stall: Duration) {
        *self.stall_after_read.lock() = Some(stall);
    }

    async fn maybe_wait(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BackingStore for ProbeBackend {
    async fn atomic_write(&self, session_id: &str, record: &Value) -> SessionResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.maybe_wait().await;
        self.inner.atomic_write(session_id, record).await
    }

    async fn atomic_read(&self, session_id: &str) -> SessionResult<Option<Value>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.maybe_wait().await;
        let record = self.inner.atomic_read(session_id).await;
        let stall = *self.stall_after_read.lock();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        record
    }
}

pub fn session_id(raw: &str) -> SessionId {
    SessionId::new(raw).expect("session id")
}

/// A context that has searched for laptops and is refining constraints.
pub fn shopping_context(raw_id: &str) -> SessionContext {
    let mut ctx = SessionContext::new(session_id(raw_id));
    ctx.set_preference("category", json!("laptop"));
    ctx.set_preference("budget", json!({"max": 1500, "currency": "EUR"}));
    ctx.add_constraint(json!("weight < 1.5kg"));
    ctx.update_state(ContractState::Search);
    ctx.record_pipeline_execution(
        "product_search",
        &json!({"status": "success", "summary": "3 candidates"}),
        Some(0.42),
    );
    ctx.set_search_results(vec![json!({"sku": "A1"}), json!({"sku": "B2"})]);
    ctx.record_tool_use("catalog_lookup");
    ctx.update_state(ContractState::RefineConstraints);
    ctx
}
