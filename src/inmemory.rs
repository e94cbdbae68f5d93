use crate::error::{SessionError, SessionResult};
use crate::store::BackingStore;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;

struct Entry {
    record: Value,
    written_at: OffsetDateTime,
}

/// Backing store kept in a concurrent hash map, for tests and single-process deployments.
///
/// Each write replaces the whole entry under the shard lock, so reads never see a partial
/// record.
#[derive(Default)]
pub struct InMemoryBackingStore {
    entries: DashMap<String, Entry>,
    offline: Mutex<Option<String>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with `reason` until [`Self::restore`] is called.
    pub fn take_offline(&self, reason: impl Into<String>) {
        *self.offline.lock() = Some(reason.into());
    }

    pub fn restore(&self) {
        *self.offline.lock() = None;
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// When the record for `session_id` was last written.
    pub fn written_at(&self, session_id: &str) -> Option<OffsetDateTime> {
        self.entries.get(session_id).map(|entry| entry.written_at)
    }

    /// Stores `record` without any checks, e.g. to seed a corrupted record in tests.
    pub fn insert_raw(&self, session_id: impl Into<String>, record: Value) {
        self.entries.insert(
            session_id.into(),
            Entry {
                record,
                written_at: OffsetDateTime::now_utc(),
            },
        );
    }

    fn ensure_online(&self) -> SessionResult<()> {
        match self.offline.lock().as_ref() {
            Some(reason) => Err(SessionError::Backend(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    async fn atomic_write(&self, session_id: &str, record: &Value) -> SessionResult<()> {
        self.ensure_online()?;
        self.insert_raw(session_id, record.clone());
        Ok(())
    }

    async fn atomic_read(&self, session_id: &str) -> SessionResult<Option<Value>> {
        self.ensure_online()?;
        Ok(self
            .entries
            .get(session_id)
            .map(|entry| entry.record.clone()))
    }
}
