//! Worker / orchestrator
//!
//! Consumes session lifecycle events from the bus and drives each session
//! through the pipeline state machine: lease → tune → start → serve →
//! drain → stop. The lease on the service key linearizes all writes for a
//! session; losing it forces the session down. Panics in event handling
//! terminate that event only, are counted, and the loop continues.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::events::{BusEvent, EventBus};
use crate::pipeline::{
    MediaPipeline, PipelineHealth, RunHandle, StreamMode, StreamSource, StreamSpec,
};
use crate::receiver::{Receiver, ReceiverError};
use crate::resources::ResourceMonitor;
use crate::store::{
    PipelineRecord, PipelineState, Reason, SessionState, StateStore, StopReason, Update,
};

/// How often the packager output is polled while waiting for the first
/// manifest
const MANIFEST_POLL: Duration = Duration::from_millis(100);

struct ActiveSession {
    service_key: String,
    run_handle: RunHandle,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    pipeline: Arc<dyn MediaPipeline>,
    receiver: Arc<dyn Receiver>,
    resources: Arc<ResourceMonitor>,

    /// Worker identity; lease owner string
    owner: String,
    hls_root: PathBuf,
    tuner_slots: Vec<u32>,
    segment_seconds: u32,
    lease_ttl_secs: i64,
    preflight_timeout: Duration,
    transcode_start: Duration,
    pipeline_stop_timeout: Duration,

    start_sem: Arc<Semaphore>,
    stop_sem: Arc<Semaphore>,

    active: Mutex<HashMap<String, ActiveSession>>,
    panics: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        cfg: &AppConfig,
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        pipeline: Arc<dyn MediaPipeline>,
        receiver: Arc<dyn Receiver>,
        resources: Arc<ResourceMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            pipeline,
            receiver,
            resources,
            owner: Self::worker_identity(),
            hls_root: PathBuf::from(&cfg.hls.root),
            tuner_slots: cfg.engine.tuner_slots.clone(),
            segment_seconds: cfg.hls.segment_seconds,
            lease_ttl_secs: cfg.worker.lease_ttl_secs,
            preflight_timeout: Duration::from_secs(cfg.enigma2.preflight_timeout_secs),
            transcode_start: Duration::from_secs(cfg.timeouts.transcode_start_secs),
            pipeline_stop_timeout: Duration::from_secs(cfg.timeouts.pipeline_stop_secs),
            start_sem: Arc::new(Semaphore::new(cfg.worker.start_concurrency)),
            stop_sem: Arc::new(Semaphore::new(cfg.worker.stop_concurrency)),
            active: Mutex::new(HashMap::new()),
            panics: AtomicU64::new(0),
        })
    }

    /// `host-pid-uuid` owner string, computed once per process
    fn worker_identity() -> String {
        let host = std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "xg2g".to_string());
        format!(
            "{host}-{}-{}",
            std::process::id(),
            &Uuid::new_v4().to_string()[..8]
        )
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    pub fn hls_dir(&self, session_id: &str) -> PathBuf {
        self.hls_root.join("sessions").join(session_id)
    }

    /// Subscribe to the bus and process events until shutdown
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = this.bus.subscribe_topics(BusEvent::LIFECYCLE_TOPICS);
            tracing::info!(owner = this.owner.as_str(), "orchestrator started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("orchestrator shutting down");
                        this.drain_all().await;
                        return;
                    }
                    event = rx.recv() => match event {
                        Ok(event) => this.dispatch(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "orchestrator lagged behind the bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        })
    }

    /// Handle one event on its own task, with a panic boundary
    fn dispatch(self: &Arc<Self>, event: BusEvent) {
        let this = self.clone();
        tokio::spawn(async move {
            let fut = std::panic::AssertUnwindSafe(this.handle_event(event));
            if fut.catch_unwind().await.is_err() {
                this.panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!("panic in orchestrator event handler");
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, event: BusEvent) {
        match event {
            BusEvent::SessionStart { session_id } => self.handle_start(&session_id).await,
            BusEvent::SessionStop {
                session_id,
                stop_reason,
                reason,
            } => self.handle_stop(&session_id, stop_reason, reason).await,
            BusEvent::LeaseLost { session_id, .. } => {
                self.handle_stop(&session_id, StopReason::LeaseExpired, None)
                    .await
            }
            // Non-lifecycle topics are filtered out by the subscription
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Start flow
    // ------------------------------------------------------------------

    async fn handle_start(self: &Arc<Self>, session_id: &str) {
        let session = match self.store.get_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(session_id, error = %e, "cannot load session");
                return;
            }
        };
        if session.state != SessionState::Starting {
            // Stale or replayed event
            return;
        }

        let service_key = session.service_key();

        // At-most-once: contention fails the session, callers retry with a
        // new intent
        let lease = match self
            .store
            .try_acquire_lease(&service_key, &self.owner, self.lease_ttl_secs)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!(session_id, service_key = service_key.as_str(), "lease busy");
                self.fail_session(session_id, Reason::LeaseBusy, "lease held by another worker", None)
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(session_id, error = %e, "lease acquisition failed");
                self.fail_session(session_id, Reason::InvariantViolation, "store failure", None)
                    .await;
                return;
            }
        };

        let pipeline_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let record = PipelineRecord {
            pipeline_id: pipeline_id.clone(),
            service_key: service_key.clone(),
            pipeline_state: PipelineState::LeaseAcquired,
            lease_owner: self.owner.clone(),
            lease_expires_at: Some(lease.expires_at),
            reason: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.put_pipeline(&record).await {
            tracing::error!(session_id, error = %e, "cannot persist pipeline record");
        }

        self.set_pipeline_state(session_id, PipelineState::LeaseAcquired, Some(lease.expires_at))
            .await;

        // Tune under the preflight budget
        self.set_pipeline_state(session_id, PipelineState::TuneRequested, None)
            .await;
        let slot = self.tuner_slots.first().copied().unwrap_or(0);
        let tune = tokio::time::timeout(
            self.preflight_timeout,
            self.receiver.tune(slot, &session.service_ref),
        )
        .await
        .unwrap_or(Err(ReceiverError::Timeout));

        if let Err(err) = tune {
            let reason = match err {
                ReceiverError::Timeout => Reason::TuneTimeout,
                _ => Reason::TuneFailed,
            };
            tracing::warn!(session_id, error = %err, "tune failed");
            self.fail_session(session_id, reason, &err.to_string(), Some(&service_key))
                .await;
            return;
        }
        self.set_pipeline_state(session_id, PipelineState::Tuned, None)
            .await;

        // Pipeline start, bounded by the global start concurrency
        self.set_pipeline_state(session_id, PipelineState::FfmpegStarting, None)
            .await;
        let spec = StreamSpec {
            session_id: session_id.to_string(),
            source: StreamSource::Tuner {
                id: session.service_ref.clone(),
                tuner_slot: slot,
            },
            mode: StreamMode::Live,
            profile: session.profile.clone(),
            hls_dir: self.hls_dir(session_id),
            segment_seconds: self.segment_seconds,
        };

        let run_handle = {
            let _permit = self.start_sem.acquire().await;
            match self.pipeline.start(&spec).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "pipeline start failed");
                    self.fail_session(
                        session_id,
                        Reason::FfmpegStartFailed,
                        &e.to_string(),
                        Some(&service_key),
                    )
                    .await;
                    return;
                }
            }
        };
        self.set_pipeline_state(session_id, PipelineState::FfmpegRunning, None)
            .await;

        // Wait for the packager to produce a playable manifest
        if !self.await_manifest(&spec.hls_dir).await {
            let _ = self.pipeline.stop(&run_handle).await;
            self.fail_session(
                session_id,
                Reason::FfmpegStartFailed,
                "no manifest before transcodeStart deadline",
                Some(&service_key),
            )
            .await;
            return;
        }
        self.set_pipeline_state(session_id, PipelineState::PackagerReady, None)
            .await;

        // Serving: the session is READY for clients. The transition only
        // applies from STARTING so a stop that raced the start wins.
        let cancel = CancellationToken::new();
        self.active.lock().insert(
            session_id.to_string(),
            ActiveSession {
                service_key: service_key.clone(),
                run_handle: run_handle.clone(),
                cancel: cancel.clone(),
            },
        );
        let mut applied = false;
        self.store
            .update_session(session_id, &mut |r| {
                if r.state != SessionState::Starting {
                    return Update::Abort;
                }
                r.state = SessionState::Ready;
                r.pipeline_state = PipelineState::Serving;
                applied = true;
                Update::Apply
            })
            .await
            .ok();
        if !applied {
            tracing::warn!(session_id, "stop raced the start, tearing pipeline down");
            self.active.lock().remove(session_id);
            let _ = self.pipeline.stop(&run_handle).await;
            let _ = self.store.release_lease(&service_key, &self.owner).await;
            return;
        }
        tracing::info!(session_id, service_key = service_key.as_str(), "session serving");

        self.spawn_keeper(session_id.to_string(), service_key, run_handle, cancel);
    }

    async fn await_manifest(&self, hls_dir: &std::path::Path) -> bool {
        let manifest = hls_dir.join("master.m3u8");
        let deadline = tokio::time::Instant::now() + self.transcode_start;
        while tokio::time::Instant::now() < deadline {
            if tokio::fs::metadata(&manifest).await.is_ok() {
                return true;
            }
            tokio::time::sleep(MANIFEST_POLL).await;
        }
        false
    }

    /// Per-session lease heartbeat and health watch
    fn spawn_keeper(
        self: &Arc<Self>,
        session_id: String,
        service_key: String,
        run_handle: RunHandle,
        cancel: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let every = Duration::from_secs((this.lease_ttl_secs as u64 / 2).max(1));
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        // Renew first; a lost lease means another writer may
                        // exist and this worker must stand down
                        match this
                            .store
                            .renew_lease(&service_key, &this.owner, this.lease_ttl_secs)
                            .await
                        {
                            Ok(Some(lease)) => {
                                this.store
                                    .update_session(&session_id, &mut |r| {
                                        if r.state.is_terminal() {
                                            return Update::Abort;
                                        }
                                        r.lease_expires_at = Some(lease.expires_at);
                                        Update::Apply
                                    })
                                    .await
                                    .ok();
                            }
                            Ok(None) => {
                                tracing::warn!(
                                    session_id = session_id.as_str(),
                                    service_key = service_key.as_str(),
                                    "lease lost"
                                );
                                this.bus.publish(BusEvent::LeaseLost {
                                    session_id: session_id.clone(),
                                    service_key: service_key.clone(),
                                });
                                return;
                            }
                            Err(e) => {
                                tracing::error!(session_id = session_id.as_str(), error = %e, "lease renewal error");
                            }
                        }

                        match this.pipeline.health(&run_handle).await {
                            PipelineHealth::Running => {
                                this.bus.publish(BusEvent::PipelineTick {
                                    session_id: session_id.clone(),
                                    pipeline_state: "SERVING".into(),
                                });
                            }
                            PipelineHealth::Exited(code) => {
                                tracing::warn!(
                                    session_id = session_id.as_str(),
                                    exit_code = ?code,
                                    "pipeline exited unexpectedly"
                                );
                                this.active.lock().remove(&session_id);
                                this.fail_session(
                                    &session_id,
                                    Reason::FfmpegExit,
                                    &format!("pipeline exited with {code:?}"),
                                    Some(&service_key),
                                )
                                .await;
                                return;
                            }
                            PipelineHealth::Unknown => {
                                // Handle was reaped elsewhere (stop flow)
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Stop flow
    // ------------------------------------------------------------------

    async fn handle_stop(&self, session_id: &str, stop_reason: StopReason, reason: Option<Reason>) {
        // DRAINING gate: first writer wins, terminal sessions stay put
        let drained = self
            .store
            .update_session(session_id, &mut |r| {
                if r.state.is_terminal() || r.state == SessionState::Stopping {
                    return Update::Abort;
                }
                r.state = SessionState::Draining;
                r.stop_reason = Some(stop_reason);
                if reason.is_some() {
                    r.reason = reason;
                }
                Update::Apply
            })
            .await;
        let record = match drained {
            Ok(Some(record)) if record.state == SessionState::Draining => record,
            _ => return,
        };

        let entry = self.active.lock().remove(session_id);
        if let Some(entry) = &entry {
            entry.cancel.cancel();
        }
        let service_key = entry
            .as_ref()
            .map(|e| e.service_key.clone())
            .unwrap_or_else(|| record.service_key());

        self.store
            .update_session(session_id, &mut |r| {
                if r.state.is_terminal() {
                    return Update::Abort;
                }
                r.state = SessionState::Stopping;
                r.pipeline_state = PipelineState::StopRequested;
                Update::Apply
            })
            .await
            .ok();

        if let Some(entry) = entry {
            let _permit = self.stop_sem.acquire().await;
            let stopped = tokio::time::timeout(
                self.pipeline_stop_timeout,
                self.pipeline.stop(&entry.run_handle),
            )
            .await;
            match stopped {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id, error = %e, "pipeline stop failed");
                }
                Err(_) => {
                    // Hand off to the sweeper: session stays STOPPING, the
                    // lease is surrendered so nothing else blocks on it
                    tracing::warn!(session_id, "pipeline stop timed out, sweeper will finalize");
                    let _ = self.store.release_lease(&service_key, &self.owner).await;
                    self.resources.release(session_id);
                    return;
                }
            }
        }

        self.finalize(
            session_id,
            SessionState::Stopped,
            stop_reason,
            reason,
            None,
            &service_key,
        )
        .await;
        tracing::info!(session_id, stop_reason = ?stop_reason, "session stopped");
    }

    /// Mark a session FAILED and clean everything up
    async fn fail_session(
        &self,
        session_id: &str,
        reason: Reason,
        detail: &str,
        release_key: Option<&str>,
    ) {
        if let Some(entry) = self.active.lock().remove(session_id) {
            entry.cancel.cancel();
        }
        let key = release_key.map(str::to_string);
        self.finalize_with(
            session_id,
            SessionState::Failed,
            StopReason::Failed,
            Some(reason),
            Some(detail.to_string()),
            key.as_deref(),
        )
        .await;

        self.bus.publish(BusEvent::UiError {
            code: reason.as_str().to_string(),
            message: detail.to_string(),
            request_id: crate::web::request_id::current().unwrap_or_default(),
        });
    }

    async fn finalize(
        &self,
        session_id: &str,
        state: SessionState,
        stop_reason: StopReason,
        reason: Option<Reason>,
        detail: Option<String>,
        service_key: &str,
    ) {
        self.finalize_with(session_id, state, stop_reason, reason, detail, Some(service_key))
            .await;
    }

    /// Terminal bookkeeping: record, lease, pool slot, HLS directory
    async fn finalize_with(
        &self,
        session_id: &str,
        state: SessionState,
        stop_reason: StopReason,
        reason: Option<Reason>,
        detail: Option<String>,
        service_key: Option<&str>,
    ) {
        self.store
            .update_session(session_id, &mut |r| {
                if r.state.is_terminal() {
                    return Update::Abort;
                }
                r.state = state;
                r.pipeline_state = match state {
                    SessionState::Failed => PipelineState::Fail,
                    _ => PipelineState::Stopped,
                };
                r.stop_reason = Some(stop_reason);
                if reason.is_some() {
                    r.reason = reason;
                }
                if detail.is_some() {
                    r.reason_detail = detail.clone();
                }
                Update::Apply
            })
            .await
            .ok();

        if let Some(key) = service_key {
            let _ = self.store.release_lease(key, &self.owner).await;
        }
        self.resources.release(session_id);

        // Scheduled cleanup; the sweeper catches anything this misses
        let dir = self.hls_dir(session_id);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        });
    }

    async fn set_pipeline_state(
        &self,
        session_id: &str,
        state: PipelineState,
        lease_expires_at: Option<i64>,
    ) {
        self.store
            .update_session(session_id, &mut |r| {
                if r.state.is_terminal() {
                    return Update::Abort;
                }
                r.pipeline_state = state;
                if lease_expires_at.is_some() {
                    r.lease_expires_at = lease_expires_at;
                }
                Update::Apply
            })
            .await
            .ok();
        self.bus.publish(BusEvent::PipelineTick {
            session_id: session_id.to_string(),
            pipeline_state: state.as_str().to_string(),
        });
    }

    /// Best-effort stop of everything this worker owns, used at shutdown
    async fn drain_all(&self) {
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();
        for session_id in ids {
            self.handle_stop(&session_id, StopReason::Cleanup, None).await;
        }
    }
}
