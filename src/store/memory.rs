//! In-memory state store
//!
//! Test-grade backend with the same observable semantics as the SQLite
//! store. Locks are held only across synchronous sections.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::types::{Lease, PipelineRecord, SessionRecord};
use super::{SessionMutator, SessionVisitor, StateStore, Update};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    pipelines: HashMap<String, PipelineRecord>,
    leases: HashMap<String, Lease>,
    /// key -> (session_id, expires_at)
    idempotency: HashMap<String, (String, i64)>,
    vod_durations: HashMap<String, f64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.inner
            .lock()
            .sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn update_session(
        &self,
        id: &str,
        mutate: SessionMutator<'_>,
    ) -> Result<Option<SessionRecord>> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.sessions.get(id) else {
            return Ok(None);
        };
        let mut candidate = current.clone();
        match mutate(&mut candidate) {
            Update::Apply => {
                candidate.touch();
                inner.sessions.insert(id.to_string(), candidate.clone());
                Ok(Some(candidate))
            }
            Update::Abort => Ok(Some(current.clone())),
        }
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.inner.lock().sessions.remove(id);
        Ok(())
    }

    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()> {
        // Snapshot ids first so the visitor never runs under the lock
        let ids: Vec<String> = {
            let inner = self.inner.lock();
            let mut ids: Vec<String> = inner.sessions.keys().cloned().collect();
            ids.sort();
            ids
        };
        for id in ids {
            let record = self.inner.lock().sessions.get(&id).cloned();
            if let Some(record) = record {
                if !visit(record) {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineRecord>> {
        Ok(self.inner.lock().pipelines.get(id).cloned())
    }

    async fn put_pipeline(&self, record: &PipelineRecord) -> Result<()> {
        self.inner
            .lock()
            .pipelines
            .insert(record.pipeline_id.clone(), record.clone());
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: i64,
    ) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let mut inner = self.inner.lock();
        let holder = inner.leases.get(key);
        let free = match holder {
            None => true,
            Some(lease) => !lease.is_live(now) || lease.owner == owner,
        };
        if !free {
            return Ok(None);
        }
        let lease = Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            expires_at: now + ttl_secs,
        };
        inner.leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(key) {
            Some(lease) if lease.owner == owner && lease.is_live(now) => {
                lease.expires_at = now + ttl_secs;
                Ok(Some(lease.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.leases.get(key) {
            Some(lease) if lease.owner == owner => {
                inner.leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        Ok(self
            .inner
            .lock()
            .idempotency
            .get(key)
            .filter(|(_, expires)| now < *expires)
            .map(|(id, _)| id.clone()))
    }

    async fn put_idempotency(&self, key: &str, session_id: &str, ttl_secs: i64) -> Result<()> {
        let expires = Utc::now().timestamp() + ttl_secs;
        self.inner
            .lock()
            .idempotency
            .insert(key.to_string(), (session_id.to_string(), expires));
        Ok(())
    }

    async fn get_vod_duration(&self, recording_id: &str) -> Result<Option<f64>> {
        Ok(self.inner.lock().vod_durations.get(recording_id).copied())
    }

    async fn put_vod_duration(&self, recording_id: &str, seconds: f64) -> Result<()> {
        self.inner
            .lock()
            .vod_durations
            .insert(recording_id.to_string(), seconds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[tokio::test]
    async fn session_crud() {
        conformance::session_crud(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn update_with_abort() {
        conformance::update_with_abort(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn lease_protocol() {
        conformance::lease_protocol(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn lease_single_writer_under_contention() {
        conformance::lease_single_writer(std::sync::Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn idempotency_ttl() {
        conformance::idempotency_keys(&MemoryStore::new()).await;
    }
}
