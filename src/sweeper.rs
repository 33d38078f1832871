//! Sweeper
//!
//! Periodic garbage collection: deletes terminal sessions past retention,
//! force-finalizes sessions stuck in STOPPING (a worker died mid-stop), and
//! removes orphan HLS directories from disk. Directory deletion only ever
//! touches names matching the safe-id pattern.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::store::{PipelineState, Reason, SessionState, StateStore, Update};
use crate::utils::is_safe_session_id;

/// A session stuck in STOPPING longer than this is force-finalized
const STUCK_STOPPING_AFTER_SECS: i64 = 60;

pub struct Sweeper {
    store: Arc<dyn StateStore>,
    hls_root: PathBuf,
    interval: Duration,
    session_retention_secs: i64,
    file_retention: Duration,
    panics: AtomicU64,
}

impl Sweeper {
    pub fn new(cfg: &AppConfig, store: Arc<dyn StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            hls_root: PathBuf::from(&cfg.hls.root),
            interval: Duration::from_secs(cfg.sweeper.interval_secs),
            session_retention_secs: cfg.sweeper.session_retention_secs,
            file_retention: Duration::from_secs(cfg.sweeper.file_retention_secs),
            panics: AtomicU64::new(0),
        })
    }

    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        // A panic ends this iteration, not the loop
                        let fut = std::panic::AssertUnwindSafe(this.sweep_once());
                        if fut.catch_unwind().await.is_err() {
                            this.panics.fetch_add(1, Ordering::Relaxed);
                            tracing::error!("panic in sweeper iteration");
                        }
                    }
                }
            }
        })
    }

    /// One full pass over the store and the HLS root
    pub async fn sweep_once(&self) {
        let now = Utc::now().timestamp();

        let mut live_ids: HashSet<String> = HashSet::new();
        let mut expired: Vec<String> = Vec::new();
        let mut stuck: Vec<String> = Vec::new();

        let scan = self
            .store
            .scan_sessions(&mut |record| {
                live_ids.insert(record.session_id.clone());
                let age = now - record.updated_at;
                if record.state.is_terminal() && age > self.session_retention_secs {
                    expired.push(record.session_id.clone());
                } else if record.state == SessionState::Stopping && age > STUCK_STOPPING_AFTER_SECS
                {
                    stuck.push(record.session_id.clone());
                }
                true
            })
            .await;
        if let Err(e) = scan {
            tracing::error!(error = %e, "sweeper scan failed");
            return;
        }

        for session_id in &stuck {
            self.force_finalize(session_id).await;
        }

        for session_id in &expired {
            tracing::debug!(session_id = session_id.as_str(), "deleting retained session");
            if let Err(e) = self.store.delete_session(session_id).await {
                tracing::warn!(session_id = session_id.as_str(), error = %e, "session delete failed");
                continue;
            }
            live_ids.remove(session_id);
            self.remove_session_dir(session_id).await;
        }

        self.sweep_orphan_dirs(&live_ids).await;
    }

    /// A worker died mid-stop: finish the job it started
    async fn force_finalize(&self, session_id: &str) {
        tracing::warn!(session_id, "force-finalizing stuck STOPPING session");
        let updated = self
            .store
            .update_session(session_id, &mut |record| {
                if record.state != SessionState::Stopping {
                    return Update::Abort;
                }
                record.state = SessionState::Stopped;
                record.pipeline_state = PipelineState::Stopped;
                record.reason = Some(Reason::IdleTimeout);
                record.reason_detail = Some("sweeper_forced_stop_stuck".into());
                Update::Apply
            })
            .await;
        if updated.is_ok() {
            self.remove_session_dir(session_id).await;
        }
    }

    async fn remove_session_dir(&self, session_id: &str) {
        if !is_safe_session_id(session_id) {
            tracing::error!(session_id, "refusing to delete unsafe directory name");
            return;
        }
        let dir = self.hls_root.join("sessions").join(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!(session_id, "removed HLS directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(session_id, error = %e, "HLS directory removal failed"),
        }
    }

    /// Remove directories on disk that no session record claims
    async fn sweep_orphan_dirs(&self, live_ids: &HashSet<String>) {
        let sessions_dir = self.hls_root.join("sessions");
        let mut entries = match tokio::fs::read_dir(&sessions_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            // Only names the engine could have produced are candidates
            if !is_safe_session_id(name) || live_ids.contains(name) {
                continue;
            }

            let old_enough = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime
                    .elapsed()
                    .map(|age| age >= self.file_retention)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if !old_enough {
                continue;
            }

            tracing::info!(dir = name, "removing orphan HLS directory");
            if let Err(e) = tokio::fs::remove_dir_all(entry.path()).await {
                tracing::warn!(dir = name, error = %e, "orphan removal failed");
            }
        }
    }
}
