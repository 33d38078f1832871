//! Transactional state store
//!
//! Sessions, pipelines and leases are persisted through the [`StateStore`]
//! trait. The SQLite backend is the durable production store; the in-memory
//! backend keeps identical semantics for tests. Session records are only
//! mutated through [`StateStore::update_session`], which runs the mutator
//! inside a single transaction so the lease owner stays the single writer.

pub mod memory;
pub mod sqlite;
pub mod types;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    service_key, Lease, PipelineRecord, PipelineState, Profile, Reason, SessionRecord,
    SessionState, StopReason,
};

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a read-modify-write mutator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Commit the mutated record
    Apply,
    /// Abort the transaction, leaving the record untouched
    Abort,
}

/// Mutator passed to [`StateStore::update_session`]
pub type SessionMutator<'a> = &'a mut (dyn FnMut(&mut SessionRecord) -> Update + Send);

/// Visitor passed to [`StateStore::scan_sessions`]; return `false` to stop
pub type SessionVisitor<'a> = &'a mut (dyn FnMut(SessionRecord) -> bool + Send);

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace a session record
    async fn put_session(&self, record: &SessionRecord) -> Result<()>;

    /// Read-modify-write inside a single transaction.
    ///
    /// Returns the record as it stands after the call (mutated on
    /// [`Update::Apply`], untouched on [`Update::Abort`]) or `None` when the
    /// session does not exist.
    async fn update_session(
        &self,
        id: &str,
        mutate: SessionMutator<'_>,
    ) -> Result<Option<SessionRecord>>;

    /// Idempotent delete
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Stream all sessions through `visit` in short bounded pages so writers
    /// are never blocked for a whole table scan
    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()>;

    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineRecord>>;

    async fn put_pipeline(&self, record: &PipelineRecord) -> Result<()>;

    /// Acquire the lease on `key` for `owner`, or return `None` when another
    /// owner holds a live lease. Re-acquiring an own live lease extends it.
    async fn try_acquire_lease(&self, key: &str, owner: &str, ttl_secs: i64)
        -> Result<Option<Lease>>;

    /// Extend an owned live lease; `None` when the lease is not held by
    /// `owner` or has already expired
    async fn renew_lease(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<Option<Lease>>;

    /// Release an owned lease; returns whether a lease was actually removed
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool>;

    /// Look up the session created under an idempotency key, if the key is
    /// still within its TTL
    async fn get_idempotency(&self, key: &str) -> Result<Option<String>>;

    /// Remember `session_id` under `key` for `ttl_secs`
    async fn put_idempotency(&self, key: &str, session_id: &str, ttl_secs: i64) -> Result<()>;

    /// Durable VOD duration lookup (the "store" tier of the duration path)
    async fn get_vod_duration(&self, recording_id: &str) -> Result<Option<f64>>;

    async fn put_vod_duration(&self, recording_id: &str, seconds: f64) -> Result<()>;
}

/// Behavioural suite run against every backend, so the in-memory store can
/// stand in for SQLite in orchestration tests without semantic drift.
#[cfg(test)]
pub(crate) mod conformance {
    use std::sync::Arc;

    use super::types::{Profile, SessionRecord, SessionState};
    use super::{StateStore, Update};

    pub fn sample_session(id: &str) -> SessionRecord {
        SessionRecord::new(
            id.to_string(),
            "1:0:19:132F:3EF:1:C00000:0:0:0:".into(),
            Profile::named("web_opt"),
            "req-test".into(),
            300,
            15,
        )
    }

    pub async fn session_crud(store: &dyn StateStore) {
        assert!(store.get_session("missing1234").await.unwrap().is_none());

        let rec = sample_session("sess_crud_0001");
        store.put_session(&rec).await.unwrap();
        let loaded = store.get_session("sess_crud_0001").await.unwrap().unwrap();
        assert_eq!(loaded, rec);

        let mut seen = Vec::new();
        store
            .scan_sessions(&mut |r| {
                seen.push(r.session_id);
                true
            })
            .await
            .unwrap();
        assert_eq!(seen, vec!["sess_crud_0001".to_string()]);

        store.delete_session("sess_crud_0001").await.unwrap();
        store.delete_session("sess_crud_0001").await.unwrap();
        assert!(store.get_session("sess_crud_0001").await.unwrap().is_none());
    }

    pub async fn update_with_abort(store: &dyn StateStore) {
        let rec = sample_session("sess_upd_0001");
        store.put_session(&rec).await.unwrap();

        let updated = store
            .update_session("sess_upd_0001", &mut |r| {
                r.state = SessionState::Ready;
                Update::Apply
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, SessionState::Ready);
        assert!(updated.updated_at >= rec.updated_at);

        let unchanged = store
            .update_session("sess_upd_0001", &mut |r| {
                r.state = SessionState::Failed;
                Update::Abort
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.state, SessionState::Ready);

        assert!(store
            .update_session("missing1234", &mut |_| Update::Apply)
            .await
            .unwrap()
            .is_none());
    }

    pub async fn lease_protocol(store: &dyn StateStore) {
        let key = "1:0:1:Contentious|web_opt";

        let lease = store
            .try_acquire_lease(key, "host-1-a", 30)
            .await
            .unwrap()
            .expect("first acquire wins");
        assert_eq!(lease.owner, "host-1-a");

        // A second owner is locked out while the lease is live
        assert!(store
            .try_acquire_lease(key, "host-2-b", 30)
            .await
            .unwrap()
            .is_none());

        // The owner can re-acquire (extend) and renew
        assert!(store
            .try_acquire_lease(key, "host-1-a", 30)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .renew_lease(key, "host-1-a", 30)
            .await
            .unwrap()
            .is_some());

        // Renewal by a non-owner never extends
        assert!(store.renew_lease(key, "host-2-b", 30).await.unwrap().is_none());

        // Release by non-owner is a no-op; by owner frees the key
        assert!(!store.release_lease(key, "host-2-b").await.unwrap());
        assert!(store.release_lease(key, "host-1-a").await.unwrap());
        assert!(store
            .try_acquire_lease(key, "host-2-b", 30)
            .await
            .unwrap()
            .is_some());
    }

    pub async fn lease_single_writer(store: Arc<dyn StateStore>) {
        let key = "1:0:1:Race|web_opt";
        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .try_acquire_lease(key, &format!("host-{i}"), 30)
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent acquire may win");
    }

    pub async fn idempotency_keys(store: &dyn StateStore) {
        assert!(store.get_idempotency("idem-a").await.unwrap().is_none());

        store.put_idempotency("idem-a", "sess_1", 60).await.unwrap();
        assert_eq!(
            store.get_idempotency("idem-a").await.unwrap().as_deref(),
            Some("sess_1")
        );

        // An expired key behaves like a missing one
        store.put_idempotency("idem-b", "sess_2", -1).await.unwrap();
        assert!(store.get_idempotency("idem-b").await.unwrap().is_none());
    }
}
