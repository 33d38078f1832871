//! SQLite state store
//!
//! Durable backend over two per-module database files: `sessions.sqlite`
//! (sessions, pipelines, leases, idempotency keys) and `capabilities.sqlite`
//! (VOD duration cache). Records are stored as JSON with the queryable
//! columns mirrored alongside, and every mutation of a session happens
//! inside one transaction.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use super::types::{Lease, PipelineRecord, SessionRecord};
use super::{SessionMutator, SessionVisitor, StateStore, Update};
use crate::error::{AppError, Result};

/// Page size for session scans; keeps writers unblocked during sweeps
const SCAN_PAGE: i64 = 100;

pub struct SqliteStore {
    sessions: Pool<Sqlite>,
    capabilities: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (and create if needed) the per-module database files under
    /// `data_dir`
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let sessions = Self::open_pool(&data_dir.join("sessions.sqlite")).await?;
        let capabilities = Self::open_pool(&data_dir.join("capabilities.sqlite")).await?;

        Self::init_sessions_schema(&sessions).await?;
        Self::init_capabilities_schema(&capabilities).await?;

        Ok(Self {
            sessions,
            capabilities,
        })
    }

    async fn open_pool(db_path: &Path) -> Result<Pool<Sqlite>> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            // SQLite is single-writer; one read plus one write connection
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;
        Ok(pool)
    }

    async fn init_sessions_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                service_key TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                pipeline_id TEXT PRIMARY KEY,
                service_key TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                service_key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Self::init_migration_history(pool, "sessions").await
    }

    async fn init_capabilities_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vod_durations (
                recording_id TEXT PRIMARY KEY,
                duration_secs REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Self::init_migration_history(pool, "capabilities").await
    }

    /// Each module file carries a migration ledger; a fresh database gets a
    /// bootstrap row so external migration tools can tell "never migrated"
    /// from "created empty".
    async fn init_migration_history(pool: &Pool<Sqlite>, module: &str) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migration_history (
                module TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_path TEXT NOT NULL,
                migrated_at_ms INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                checksum TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM migration_history WHERE module = ?1")
                .bind(module)
                .fetch_one(pool)
                .await?;
        if count == 0 {
            sqlx::query(
                r#"
                INSERT INTO migration_history
                    (module, source_type, source_path, migrated_at_ms, record_count, checksum)
                VALUES (?1, 'bootstrap', '', ?2, 0, 'schema-v1')
                "#,
            )
            .bind(module)
            .bind(Utc::now().timestamp_millis())
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    fn decode_session(json: &str) -> Result<SessionRecord> {
        serde_json::from_str(json)
            .map_err(|e| AppError::Internal(format!("corrupt session record: {e}")))
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM sessions WHERE session_id = ?1")
                .bind(id)
                .fetch_optional(&self.sessions)
                .await?;
        row.map(|(json,)| Self::decode_session(&json)).transpose()
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, service_key, state, updated_at, record)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id) DO UPDATE SET
                service_key = excluded.service_key,
                state = excluded.state,
                updated_at = excluded.updated_at,
                record = excluded.record
            "#,
        )
        .bind(&record.session_id)
        .bind(record.service_key())
        .bind(record.state.as_str())
        .bind(record.updated_at)
        .bind(&json)
        .execute(&self.sessions)
        .await?;
        Ok(())
    }

    async fn update_session(
        &self,
        id: &str,
        mutate: SessionMutator<'_>,
    ) -> Result<Option<SessionRecord>> {
        let mut tx = self.sessions.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM sessions WHERE session_id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((json,)) = row else {
            return Ok(None);
        };
        let current = Self::decode_session(&json)?;

        let mut candidate = current.clone();
        match mutate(&mut candidate) {
            Update::Abort => Ok(Some(current)),
            Update::Apply => {
                candidate.touch();
                let json = serde_json::to_string(&candidate)?;
                sqlx::query(
                    r#"
                    UPDATE sessions
                    SET service_key = ?2, state = ?3, updated_at = ?4, record = ?5
                    WHERE session_id = ?1
                    "#,
                )
                .bind(id)
                .bind(candidate.service_key())
                .bind(candidate.state.as_str())
                .bind(candidate.updated_at)
                .bind(&json)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(Some(candidate))
            }
        }
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(id)
            .execute(&self.sessions)
            .await?;
        Ok(())
    }

    async fn scan_sessions(&self, visit: SessionVisitor<'_>) -> Result<()> {
        let mut cursor = String::new();
        loop {
            let rows: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT session_id, record FROM sessions
                WHERE session_id > ?1
                ORDER BY session_id
                LIMIT ?2
                "#,
            )
            .bind(&cursor)
            .bind(SCAN_PAGE)
            .fetch_all(&self.sessions)
            .await?;

            let Some((last_id, _)) = rows.last() else {
                return Ok(());
            };
            cursor = last_id.clone();

            for (_, json) in &rows {
                if !visit(Self::decode_session(json)?) {
                    return Ok(());
                }
            }
        }
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<PipelineRecord>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT record FROM pipelines WHERE pipeline_id = ?1")
                .bind(id)
                .fetch_optional(&self.sessions)
                .await?;
        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| AppError::Internal(format!("corrupt pipeline record: {e}")))
        })
        .transpose()
    }

    async fn put_pipeline(&self, record: &PipelineRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            r#"
            INSERT INTO pipelines (pipeline_id, service_key, updated_at, record)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(pipeline_id) DO UPDATE SET
                service_key = excluded.service_key,
                updated_at = excluded.updated_at,
                record = excluded.record
            "#,
        )
        .bind(&record.pipeline_id)
        .bind(&record.service_key)
        .bind(record.updated_at)
        .bind(&json)
        .execute(&self.sessions)
        .await?;
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: i64,
    ) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_secs;

        // Atomic: insert wins when no row exists; the conditional upsert
        // takes over only an expired or self-owned lease.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (service_key, owner, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(service_key) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE leases.expires_at <= ?4 OR leases.owner = excluded.owner
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.sessions)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(Lease {
                key: key.to_string(),
                owner: owner.to_string(),
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    async fn renew_lease(&self, key: &str, owner: &str, ttl_secs: i64) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_secs;
        let result = sqlx::query(
            r#"
            UPDATE leases SET expires_at = ?3
            WHERE service_key = ?1 AND owner = ?2 AND expires_at > ?4
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.sessions)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(Lease {
                key: key.to_string(),
                owner: owner.to_string(),
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE service_key = ?1 AND owner = ?2")
            .bind(key)
            .bind(owner)
            .execute(&self.sessions)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_idempotency(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp();
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT session_id FROM idempotency_keys WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.sessions)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn put_idempotency(&self, key: &str, session_id: &str, ttl_secs: i64) -> Result<()> {
        let expires_at = Utc::now().timestamp() + ttl_secs;
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, session_id, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                session_id = excluded.session_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(session_id)
        .bind(expires_at)
        .execute(&self.sessions)
        .await?;
        Ok(())
    }

    async fn get_vod_duration(&self, recording_id: &str) -> Result<Option<f64>> {
        let row: Option<(f64,)> =
            sqlx::query_as("SELECT duration_secs FROM vod_durations WHERE recording_id = ?1")
                .bind(recording_id)
                .fetch_optional(&self.capabilities)
                .await?;
        Ok(row.map(|(secs,)| secs))
    }

    async fn put_vod_duration(&self, recording_id: &str, seconds: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vod_durations (recording_id, duration_secs, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(recording_id) DO UPDATE SET
                duration_secs = excluded.duration_secs,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(recording_id)
        .bind(seconds)
        .bind(Utc::now().timestamp())
        .execute(&self.capabilities)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn session_crud() {
        let (_dir, store) = open_store().await;
        conformance::session_crud(&store).await;
    }

    #[tokio::test]
    async fn update_with_abort() {
        let (_dir, store) = open_store().await;
        conformance::update_with_abort(&store).await;
    }

    #[tokio::test]
    async fn lease_protocol() {
        let (_dir, store) = open_store().await;
        conformance::lease_protocol(&store).await;
    }

    #[tokio::test]
    async fn lease_single_writer_under_contention() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path()).await.unwrap());
        conformance::lease_single_writer(store).await;
    }

    #[tokio::test]
    async fn idempotency_ttl() {
        let (_dir, store) = open_store().await;
        conformance::idempotency_keys(&store).await;
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        let rec = conformance::sample_session("sess_persist_1");
        {
            let store = SqliteStore::open(dir.path()).await.unwrap();
            store.put_session(&rec).await.unwrap();
        }
        let store = SqliteStore::open(dir.path()).await.unwrap();
        let loaded = store.get_session("sess_persist_1").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn vod_duration_cache() {
        let (_dir, store) = open_store().await;
        assert!(store.get_vod_duration("rec1").await.unwrap().is_none());
        store.put_vod_duration("rec1", 3612.5).await.unwrap();
        assert_eq!(store.get_vod_duration("rec1").await.unwrap(), Some(3612.5));
    }
}
