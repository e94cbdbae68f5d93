//! Cached front door for contract session persistence.
//!
//! ```text
//! save ──► validate ──► backing write (timeout) ──► ok? refresh cache slot
//! load ──► cache slot fresh? return
//!               │ miss / expired
//!               ▼
//!          backing read (timeout) ──► validate ──► repopulate cache
//! ```
//!
//! Expected failures (missing session, invalid context, corrupted record, backend errors and
//! timeouts) surface as `false` / `None` and a log event, never as a panic.

use crate::error::{SessionError, SessionResult, ValidationError};
use crate::model::{SessionContext, StoredSession, Transition, DEFAULT_CONTRACT_TEMPLATE};
use crate::monitor::TransitionMonitor;
use crate::store::{create_backing_store, BackendConfig, BackingStore};
use crate::validator;
use crate::workflow::{ContractWorkflow, WorkflowFactory};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

/// Monitor target recorded for rejected transitions to unknown state names.
pub const INVALID_TARGET: &str = "invalid";

/// Tunables for [`UnifiedSessionStore`].
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a cached record is served without consulting the backing store.
    pub ttl: Duration,
    /// Soft bound on cached sessions.
    pub capacity: usize,
    /// Share of the cache dropped, oldest first, when the bound is hit.
    pub eviction_fraction: f64,
    /// Saves and loads slower than this are logged at warn level.
    pub slow_operation_threshold: Duration,
    /// Budget for a single backing store call.
    pub backend_timeout: Duration,
    /// Template reference written into records by [`UnifiedSessionStore::save`].
    pub contract_template: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1000,
            eviction_fraction: 0.1,
            slow_operation_threshold: Duration::from_millis(10),
            backend_timeout: Duration::from_secs(2),
            contract_template: DEFAULT_CONTRACT_TEMPLATE.to_owned(),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `CONTRACT_SESSION_TTL_SECS`, `CONTRACT_SESSION_CACHE_CAPACITY`,
    /// `CONTRACT_SESSION_SLOW_MS` and `CONTRACT_SESSION_BACKEND_TIMEOUT_MS`. Unparsable values
    /// are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_u64("CONTRACT_SESSION_TTL_SECS") {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_u64("CONTRACT_SESSION_CACHE_CAPACITY") {
            config.capacity = capacity as usize;
        }
        if let Some(ms) = env_u64("CONTRACT_SESSION_SLOW_MS") {
            config.slow_operation_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CONTRACT_SESSION_BACKEND_TIMEOUT_MS") {
            config.backend_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation_threshold = threshold;
        self
    }

    pub fn with_backend_timeout(mut self, budget: Duration) -> Self {
        self.backend_timeout = budget;
        self
    }

    pub fn with_contract_template(mut self, template: impl Into<String>) -> Self {
        self.contract_template = template.into();
        self
    }

    /// Number of entries dropped per eviction round.
    fn eviction_batch(&self) -> usize {
        let batch = (self.capacity as f64 * self.eviction_fraction).ceil();
        if batch.is_finite() && batch >= 1.0 {
            batch as usize
        } else {
            1
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

struct CacheEntry {
    record: StoredSession,
    written_at: Instant,
}

#[derive(Default)]
struct LatencySeries {
    count: u64,
    total: Duration,
    max: Duration,
    min: Option<Duration>,
}

impl LatencySeries {
    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
    }

    fn snapshot(&self) -> LatencyStats {
        if self.count == 0 {
            return LatencyStats::default();
        }
        LatencyStats {
            count: self.count,
            avg_ms: millis(self.total) / self.count as f64,
            max_ms: millis(self.max),
            min_ms: self.min.map(millis).unwrap_or_default(),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Summary of one latency series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub min_ms: f64,
}

/// Point-in-time view of store performance.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub save: LatencyStats,
    pub load: LatencyStats,
    pub cache_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
}

/// TTL-bounded cache in front of an injected [`BackingStore`].
///
/// Each cache slot is replaced whole under its shard lock, so a load never sees a
/// half-updated entry. Saves to the same session from different tasks are last-writer-wins.
pub struct UnifiedSessionStore {
    backend: Arc<dyn BackingStore>,
    config: StoreConfig,
    cache: DashMap<String, CacheEntry>,
    eviction: Mutex<()>,
    save_latency: Mutex<LatencySeries>,
    load_latency: Mutex<LatencySeries>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    monitor: Option<Arc<TransitionMonitor>>,
}

impl UnifiedSessionStore {
    pub fn new(backend: Arc<dyn BackingStore>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            cache: DashMap::new(),
            eviction: Mutex::new(()),
            save_latency: Mutex::new(LatencySeries::default()),
            load_latency: Mutex::new(LatencySeries::default()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            monitor: None,
        }
    }

    /// Builds the backing store from `backend` and wraps it.
    pub fn from_config(backend: BackendConfig, config: StoreConfig) -> SessionResult<Self> {
        Ok(Self::new(create_backing_store(backend)?, config))
    }

    /// Feeds transitions made through [`Self::advance`] and detected corruption to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<TransitionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn monitor(&self) -> Option<&Arc<TransitionMonitor>> {
        self.monitor.as_ref()
    }

    /// Persists `context` under `session_id` with the configured template reference.
    pub async fn save(&self, session_id: &str, context: &SessionContext) -> bool {
        self.save_with_template(session_id, context, &self.config.contract_template)
            .await
    }

    /// Persists `context` and, once the backing write succeeded, refreshes its cache slot.
    ///
    /// Returns `false` without touching cache or backend when the context is invalid, and
    /// `false` with the previous cache slot intact when the backend fails or times out.
    pub async fn save_with_template(
        &self,
        session_id: &str,
        context: &SessionContext,
        contract_template: &str,
    ) -> bool {
        let started = Instant::now();
        let record = match Self::prepare(session_id, context, contract_template) {
            Ok(record) => record,
            Err(err) => {
                warn!(session_id, error = %err, "rejected invalid session context");
                self.report_corruption(session_id, &err);
                return false;
            }
        };
        let value = match record.to_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(session_id, error = %err, "failed to encode session record");
                return false;
            }
        };

        if let Err(err) = self
            .guarded(self.backend.atomic_write(session_id, &value))
            .await
        {
            warn!(session_id, error = %err, "backing store write failed");
            return false;
        }

        self.insert_cached(session_id, record);
        if let Some(monitor) = &self.monitor {
            monitor.observe_history(session_id, context.state_history());
        }
        let elapsed = started.elapsed();
        self.save_latency.lock().record(elapsed);
        self.warn_if_slow("save", session_id, elapsed);
        true
    }

    /// Restores the context stored under `session_id`, or `None` if there is none or it
    /// cannot be trusted.
    pub async fn load(&self, session_id: &str) -> Option<SessionContext> {
        self.load_record(session_id)
            .await
            .map(|(context, _)| context)
    }

    /// Restores a session and hands it to the workflow rebuilt from its stored template.
    pub async fn load_workflow<F>(&self, session_id: &str, factory: &F) -> Option<F::Workflow>
    where
        F: WorkflowFactory,
    {
        let (context, template) = self.load_record(session_id).await?;
        let Some(mut workflow) = factory.reconstruct(&template) else {
            warn!(
                session_id,
                template = %template,
                "no workflow registered for contract template"
            );
            return None;
        };
        workflow.attach_context(context);
        Some(workflow)
    }

    /// Validates and applies a transition on `context`, reporting the attempt to the
    /// attached monitor. Nothing is persisted.
    ///
    /// Rejected targets that are not state names are counted under [`INVALID_TARGET`].
    pub fn advance(&self, context: &mut SessionContext, target: &str) -> SessionResult<Transition> {
        let from = context.current_state();
        let outcome = context.try_transition(target);
        let Some(monitor) = &self.monitor else {
            return outcome;
        };
        let session_id = context.session_id().as_str();
        match &outcome {
            Ok(transition) => {
                monitor.observe_transition(session_id, transition);
            }
            Err(err) => {
                warn!(session_id, error = %err, "transition rejected");
                let to = if validator::is_valid_state(target) {
                    target
                } else {
                    INVALID_TARGET
                };
                monitor.record_transition(session_id, from.as_str(), to, false);
            }
        }
        outcome
    }

    /// Drops the cache slot for `session_id`; the backing record is untouched.
    pub fn invalidate(&self, session_id: &str) -> bool {
        self.cache.remove(session_id).is_some()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Read-only snapshot of latency and cache counters.
    pub fn get_performance_metrics(&self) -> PerformanceMetrics {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        PerformanceMetrics {
            save: self.save_latency.lock().snapshot(),
            load: self.load_latency.lock().snapshot(),
            cache_size: self.cache.len(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn prepare(
        session_id: &str,
        context: &SessionContext,
        contract_template: &str,
    ) -> SessionResult<StoredSession> {
        if session_id.trim().is_empty() {
            return Err(SessionError::Serialization(ValidationError::EmptyField(
                "session_id",
            )));
        }
        if context.session_id().as_str() != session_id {
            return Err(SessionError::Serialization(
                ValidationError::SessionMismatch {
                    given: session_id.to_owned(),
                    context: context.session_id().to_string(),
                },
            ));
        }
        if !context.status_consistent() {
            warn!(
                session_id,
                state = %context.current_state(),
                status = ?context.contract_status(),
                "contract status disagrees with workflow state"
            );
        }
        context.serialize_with_template(contract_template)
    }

    async fn load_record(&self, session_id: &str) -> Option<(SessionContext, String)> {
        let started = Instant::now();
        if let Some(record) = self.cached(session_id) {
            let template = record.template().to_owned();
            match SessionContext::from_stored(record) {
                Ok(context) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(session_id, "session cache hit");
                    self.finish_load(session_id, started);
                    return Some((context, template));
                }
                Err(err) => {
                    error!(session_id, error = %err, "dropping unreadable cache entry");
                    self.cache.remove(session_id);
                }
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let value = match self.guarded(self.backend.atomic_read(session_id)).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(session_id, "no stored session");
                return None;
            }
            Err(err) => {
                warn!(session_id, error = %err, "backing store read failed");
                return None;
            }
        };

        let context = match SessionContext::deserialize(&value) {
            Ok(context) => context,
            Err(err) => {
                error!(session_id, error = %err, "discarding corrupted session record");
                self.report_corruption(session_id, &err);
                return None;
            }
        };
        if context.session_id().as_str() != session_id {
            error!(
                session_id,
                stored = %context.session_id(),
                "stored record belongs to another session"
            );
            return None;
        }

        let template = value
            .get("contract_template")
            .and_then(Value::as_str)
            .filter(|template| !template.is_empty())
            .unwrap_or(DEFAULT_CONTRACT_TEMPLATE)
            .to_owned();
        if let Ok(record) = context.serialize_with_template(&template) {
            self.fill_from_backend(session_id, record, started);
        }
        self.finish_load(session_id, started);
        Some((context, template))
    }

    fn finish_load(&self, session_id: &str, started: Instant) {
        let elapsed = started.elapsed();
        self.load_latency.lock().record(elapsed);
        self.warn_if_slow("load", session_id, elapsed);
    }

    async fn guarded<T>(&self, call: impl Future<Output = SessionResult<T>>) -> SessionResult<T> {
        match timeout(self.config.backend_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::Timeout(self.config.backend_timeout)),
        }
    }

    /// Returns a fresh cache entry; an expired one is removed.
    fn cached(&self, session_id: &str) -> Option<StoredSession> {
        let now = Instant::now();
        let ttl = self.config.ttl;
        {
            let entry = self.cache.get(session_id)?;
            if now.duration_since(entry.written_at) <= ttl {
                return Some(entry.record.clone());
            }
        }
        // A concurrent save may have refreshed the slot since the check above.
        self.cache
            .remove_if(session_id, |_, entry| now.duration_since(entry.written_at) > ttl);
        debug!(session_id, "session cache entry expired");
        None
    }

    fn insert_cached(&self, session_id: &str, record: StoredSession) {
        self.make_room(session_id);
        self.cache.insert(
            session_id.to_owned(),
            CacheEntry {
                record,
                written_at: Instant::now(),
            },
        );
    }

    /// Caches a record read from the backing store. A slot written at or after `read_started`
    /// came from a save that completed during the read and is kept.
    fn fill_from_backend(&self, session_id: &str, record: StoredSession, read_started: Instant) {
        self.make_room(session_id);
        let fresh = CacheEntry {
            record,
            written_at: Instant::now(),
        };
        match self.cache.entry(session_id.to_owned()) {
            Entry::Occupied(mut slot) => {
                if slot.get().written_at < read_started {
                    slot.insert(fresh);
                } else {
                    debug!(session_id, "kept cache entry written during backing read");
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }

    fn make_room(&self, session_id: &str) {
        if !self.cache.contains_key(session_id) && self.cache.len() >= self.config.capacity.max(1)
        {
            self.evict_oldest();
        }
    }

    /// Drops the oldest entries by write time so at least one slot is free.
    fn evict_oldest(&self) {
        let _round = self.eviction.lock();
        let capacity = self.config.capacity.max(1);
        let mut ages: Vec<(String, Instant)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().written_at))
            .collect();
        if ages.len() < capacity {
            return;
        }
        ages.sort_by_key(|(_, written_at)| *written_at);
        let overflow = ages.len() + 1 - capacity;
        let batch = self.config.eviction_batch().max(overflow).min(ages.len());
        for (key, _) in ages.into_iter().take(batch) {
            self.cache.remove(&key);
        }
        debug!(evicted = batch, capacity, "evicted oldest session cache entries");
    }

    fn warn_if_slow(&self, operation: &'static str, session_id: &str, elapsed: Duration) {
        let threshold = self.config.slow_operation_threshold;
        if elapsed > threshold {
            warn!(
                operation,
                session_id,
                elapsed_ms = millis(elapsed),
                threshold_ms = millis(threshold),
                "slow session store operation"
            );
        }
    }

    fn report_corruption(&self, session_id: &str, err: &SessionError) {
        if let (Some(monitor), Some(ValidationError::StepLogMismatch { .. })) =
            (&self.monitor, err.validation())
        {
            monitor.report_state_corruption(session_id, &err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_batch_is_ten_percent_and_at_least_one() {
        assert_eq!(StoreConfig::default().eviction_batch(), 100);
        assert_eq!(StoreConfig::default().with_capacity(5).eviction_batch(), 1);
        assert_eq!(StoreConfig::default().with_capacity(0).eviction_batch(), 1);
    }

    #[test]
    fn latency_series_summarizes_samples() {
        let mut series = LatencySeries::default();
        assert_eq!(series.snapshot(), LatencyStats::default());
        series.record(Duration::from_millis(2));
        series.record(Duration::from_millis(6));
        let stats = series.snapshot();
        assert_eq!(stats.count, 2);
        assert!((stats.avg_ms - 4.0).abs() < 1e-9);
        assert!((stats.max_ms - 6.0).abs() < 1e-9);
        assert!((stats.min_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let config = StoreConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(300));
        assert_eq!(config.capacity, 1000);
        assert_eq!(config.slow_operation_threshold, Duration::from_millis(10));
        assert_eq!(config.contract_template, DEFAULT_CONTRACT_TEMPLATE);
    }
}
