use crate::error::{redis_error, serde_error, SessionResult};
use crate::store::BackingStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;

const DEFAULT_NAMESPACE: &str = "contract:session";

/// Redis-backed system of record.
///
/// Every record is a single string key written with one `SET`, which Redis applies
/// atomically. Constructors accept connection URLs only; no Redis client types appear in the
/// public API. The connection is opened on first use and shared by later calls; it reconnects
/// on its own after a dropped link.
pub struct RedisBackingStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
    namespace: String,
    retention: Option<Duration>,
}

impl RedisBackingStore {
    /// Creates a store using a Redis URL and the default namespace prefix.
    pub fn from_url(url: impl AsRef<str>) -> SessionResult<Self> {
        let client = Client::open(url.as_ref()).map_err(redis_error)?;
        Ok(Self::from_client_with_namespace(client, DEFAULT_NAMESPACE))
    }

    /// Creates a store using a Redis URL and a custom namespace prefix.
    pub fn from_url_with_namespace(
        url: impl AsRef<str>,
        namespace: impl Into<String>,
    ) -> SessionResult<Self> {
        let client = Client::open(url.as_ref()).map_err(redis_error)?;
        Ok(Self::from_client_with_namespace(client, namespace))
    }

    pub(crate) fn from_client_with_namespace(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            conn: OnceCell::new(),
            namespace: namespace.into(),
            retention: None,
        }
    }

    /// Expires records `retention` after their last write. `None` keeps them forever.
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    async fn conn(&self) -> SessionResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(redis_error)
            })
            .await?;
        Ok(conn.clone())
    }

    fn session_entry_key(&self, session_id: &str) -> String {
        format!("{}:contract:{}", self.namespace, session_id)
    }

    fn retention_ms(&self) -> Option<i64> {
        self.retention.map(|ttl| {
            let ttl_ms = ttl.as_millis().max(1);
            if ttl_ms > i64::MAX as u128 {
                i64::MAX
            } else {
                ttl_ms as i64
            }
        })
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    async fn atomic_write(&self, session_id: &str, record: &Value) -> SessionResult<()> {
        let payload = serde_json::to_string(record).map_err(serde_error)?;
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.session_entry_key(session_id)).arg(payload);
        if let Some(ttl_ms) = self.retention_ms() {
            cmd.arg("PX").arg(ttl_ms);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn atomic_read(&self, session_id: &str) -> SessionResult<Option<Value>> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn
            .get(self.session_entry_key(session_id))
            .await
            .map_err(redis_error)?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(serde_error))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RedisBackingStore {
        let client = Client::open("redis://127.0.0.1/").expect("url parses");
        RedisBackingStore::from_client_with_namespace(client, "test:ns")
    }

    #[test]
    fn connection_is_opened_lazily() {
        assert!(store().conn.get().is_none());
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(store().session_entry_key("abc"), "test:ns:contract:abc");
    }

    #[test]
    fn retention_is_clamped_to_at_least_one_millisecond() {
        assert_eq!(store().retention_ms(), None);
        let store = store().with_retention(Some(Duration::from_micros(10)));
        assert_eq!(store.retention_ms(), Some(1));
        let store = store.with_retention(Some(Duration::from_secs(90)));
        assert_eq!(store.retention_ms(), Some(90_000));
    }
}
