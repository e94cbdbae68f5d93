use crate::error::SessionResult;
use crate::inmemory::InMemoryBackingStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
#[cfg(feature = "redis")]
use std::time::Duration;

/// Durable system of record behind the session cache.
///
/// Records are the JSON documents produced by [`crate::model::StoredSession::to_value`].
/// Each call must be all-or-nothing: a reader never observes a partially written record.
/// Implementations report transient failures as errors and do not retry.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Replaces the record stored for `session_id`.
    async fn atomic_write(&self, session_id: &str, record: &Value) -> SessionResult<()>;

    /// Fetches the record stored for `session_id`, if any.
    async fn atomic_read(&self, session_id: &str) -> SessionResult<Option<Value>>;
}

/// Backing store selection, made once at startup.
#[derive(Clone, Debug, Default)]
pub enum BackendConfig {
    /// Process-local map; contents die with the process.
    #[default]
    InMemory,
    /// Redis server addressed by URL, keys prefixed with `namespace`.
    #[cfg(feature = "redis")]
    Redis {
        url: String,
        namespace: Option<String>,
        /// Optional expiry applied to every written record.
        retention: Option<Duration>,
    },
}

impl BackendConfig {
    /// Picks Redis when `REDIS_URL` is set, the in-memory store otherwise.
    ///
    /// `CONTRACT_SESSION_NAMESPACE` and `CONTRACT_SESSION_RETENTION_SECS` tune the Redis backend.
    pub fn from_env() -> Self {
        #[cfg(feature = "redis")]
        {
            if let Ok(url) = std::env::var("REDIS_URL") {
                let namespace = std::env::var("CONTRACT_SESSION_NAMESPACE").ok();
                let retention = std::env::var("CONTRACT_SESSION_RETENTION_SECS")
                    .ok()
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return BackendConfig::Redis {
                    url,
                    namespace,
                    retention,
                };
            }
        }
        BackendConfig::InMemory
    }
}

/// Builds the backing store named by `config`.
pub fn create_backing_store(config: BackendConfig) -> SessionResult<Arc<dyn BackingStore>> {
    match config {
        BackendConfig::InMemory => Ok(Arc::new(InMemoryBackingStore::new())),
        #[cfg(feature = "redis")]
        BackendConfig::Redis {
            url,
            namespace,
            retention,
        } => {
            let store = match namespace {
                Some(namespace) => {
                    crate::redis_store::RedisBackingStore::from_url_with_namespace(url, namespace)?
                }
                None => crate::redis_store::RedisBackingStore::from_url(url)?,
            };
            Ok(Arc::new(store.with_retention(retention)))
        }
    }
}
