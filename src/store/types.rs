//! Session, pipeline and lease records
//!
//! These are the rows the state store persists. Components never hold
//! references into each other; everything is re-fetched by id under a
//! transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Client-visible session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    New,
    Starting,
    Ready,
    Draining,
    Stopping,
    Stopped,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Draining => "DRAINING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Internal pipeline state machine driven by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Init,
    LeaseAcquired,
    TuneRequested,
    Tuned,
    FfmpegStarting,
    FfmpegRunning,
    PackagerReady,
    Serving,
    Fail,
    StopRequested,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::LeaseAcquired => "LEASE_ACQUIRED",
            Self::TuneRequested => "TUNE_REQUESTED",
            Self::Tuned => "TUNED",
            Self::FfmpegStarting => "FFMPEG_STARTING",
            Self::FfmpegRunning => "FFMPEG_RUNNING",
            Self::PackagerReady => "PACKAGER_READY",
            Self::Serving => "SERVING",
            Self::Fail => "FAIL",
            Self::StopRequested => "STOP_REQUESTED",
            Self::Stopped => "STOPPED",
        }
    }
}

/// Stable reason codes attached to sessions and problems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    #[serde(rename = "R_BAD_REQUEST")]
    BadRequest,
    #[serde(rename = "R_NOT_FOUND")]
    NotFound,
    #[serde(rename = "R_GONE")]
    Gone,
    #[serde(rename = "R_LEASE_BUSY")]
    LeaseBusy,
    #[serde(rename = "R_TUNE_TIMEOUT")]
    TuneTimeout,
    #[serde(rename = "R_TUNE_FAILED")]
    TuneFailed,
    #[serde(rename = "R_FFMPEG_START_FAILED")]
    FfmpegStartFailed,
    #[serde(rename = "R_FFMPEG_EXIT")]
    FfmpegExit,
    #[serde(rename = "R_IDLE_TIMEOUT")]
    IdleTimeout,
    #[serde(rename = "R_INVARIANT_VIOLATION")]
    InvariantViolation,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "R_BAD_REQUEST",
            Self::NotFound => "R_NOT_FOUND",
            Self::Gone => "R_GONE",
            Self::LeaseBusy => "R_LEASE_BUSY",
            Self::TuneTimeout => "R_TUNE_TIMEOUT",
            Self::TuneFailed => "R_TUNE_FAILED",
            Self::FfmpegStartFailed => "R_FFMPEG_START_FAILED",
            Self::FfmpegExit => "R_FFMPEG_EXIT",
            Self::IdleTimeout => "R_IDLE_TIMEOUT",
            Self::InvariantViolation => "R_INVARIANT_VIOLATION",
        }
    }
}

/// Why a session stopped (or is stopping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    UserStopped,
    LeaseExpired,
    Failed,
    Cleanup,
}

/// Named playback preference set carried by an intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    /// Low-latency HLS flags for the packager
    #[serde(default)]
    pub low_latency: bool,
    /// DVR window in seconds (0 = live edge only)
    #[serde(default)]
    pub dvr_window_seconds: u32,
}

impl Profile {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            low_latency: false,
            dvr_window_seconds: 0,
        }
    }
}

/// The client-visible session ticket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub service_ref: String,
    pub profile: Profile,
    pub state: SessionState,
    pub pipeline_state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    /// Mirrors the X-Request-ID that created the session
    pub correlation_id: String,
    /// Wall-clock epoch seconds
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,
    /// Seconds between client heartbeats
    pub heartbeat_interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl SessionRecord {
    /// Fresh record as written by the intent API
    pub fn new(
        session_id: String,
        service_ref: String,
        profile: Profile,
        correlation_id: String,
        idle_timeout_secs: i64,
        heartbeat_interval: u32,
    ) -> Self {
        let now = Utc::now().timestamp();
        Self {
            session_id,
            service_ref,
            profile,
            state: SessionState::Starting,
            pipeline_state: PipelineState::Init,
            reason: None,
            reason_detail: None,
            correlation_id,
            created_at: now,
            updated_at: now,
            expires_at: now + idle_timeout_secs,
            lease_expires_at: None,
            heartbeat_interval,
            last_heartbeat: None,
            stop_reason: None,
        }
    }

    /// Lease key: one live lease per (service, profile) pair
    pub fn service_key(&self) -> String {
        service_key(&self.service_ref, &self.profile.name)
    }

    /// Stamp a mutation; `updated_at` is non-decreasing
    pub fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now().timestamp());
    }
}

/// Compose the lease key for a service/profile pair
pub fn service_key(service_ref: &str, profile_id: &str) -> String {
    format!("{service_ref}|{profile_id}")
}

/// Internal worker-side pipeline record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRecord {
    pub pipeline_id: String,
    pub service_key: String,
    pub pipeline_state: PipelineState,
    pub lease_owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A bounded, renewable right to act as the sole writer for a service key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    /// Epoch seconds; the lease is live iff `now < expires_at`
    pub expires_at: i64,
}

impl Lease {
    pub fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}
