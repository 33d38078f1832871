//! Media pipeline backends
//!
//! The worker drives an opaque process manager through [`MediaPipeline`]:
//! hand it a [`StreamSpec`], get back a run handle, poll health, stop it.
//! The production backend shells out to ffmpeg; the stub backend fakes the
//! packager for tests and dry runs.

pub mod ffmpeg;
pub mod stub;

pub use ffmpeg::FfmpegPipeline;
pub use stub::StubPipeline;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::types::Profile;

/// Where the pipeline reads from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamSource {
    /// A tuned receiver service
    Tuner { id: String, tuner_slot: u32 },
    /// An arbitrary URL (receiver stream port, upstream relay)
    Url { url: String },
    /// A local recording file
    File { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Live,
    Vod,
}

/// Contract handed to the external pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub session_id: String,
    pub source: StreamSource,
    pub mode: StreamMode,
    pub profile: Profile,
    /// Output directory for manifests and segments
    pub hls_dir: PathBuf,
    pub segment_seconds: u32,
}

/// Opaque handle for a started run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineHealth {
    Running,
    /// Process ended; `None` means killed by signal
    Exited(Option<i32>),
    /// Handle unknown to this backend
    Unknown,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline start failed: {0}")]
    StartFailed(String),

    #[error("pipeline stop timed out")]
    StopTimeout,

    #[error("unknown run handle {0}")]
    UnknownHandle(String),

    #[error("pipeline io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::StartFailed(_) | Self::Io(_) => "R_FFMPEG_START_FAILED",
            Self::StopTimeout | Self::UnknownHandle(_) => "R_FFMPEG_EXIT",
        }
    }
}

#[async_trait]
pub trait MediaPipeline: Send + Sync {
    /// Launch a run for `spec`. Returns once the process is up; manifest
    /// readiness is the caller's concern.
    async fn start(&self, spec: &StreamSpec) -> Result<RunHandle, PipelineError>;

    /// Stop a run, escalating to kill after the configured timeout.
    /// Idempotent: stopping an already-finished run succeeds.
    async fn stop(&self, handle: &RunHandle) -> Result<(), PipelineError>;

    /// Current health of a run
    async fn health(&self, handle: &RunHandle) -> PipelineHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_spec_round_trip() {
        let spec = StreamSpec {
            session_id: "sess_1".into(),
            source: StreamSource::Tuner {
                id: "1:0:19:A".into(),
                tuner_slot: 0,
            },
            mode: StreamMode::Live,
            profile: Profile::named("web_opt"),
            hls_dir: PathBuf::from("/tmp/hls/sessions/sess_1"),
            segment_seconds: 4,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"type\":\"tuner\""));
        assert!(json.contains("\"tunerSlot\":0"));
        assert!(json.contains("\"mode\":\"live\""));
        let back: StreamSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
