//! VOD playback resolver
//!
//! Classifies a recording into a playback response: direct MP4 when the
//! container already fits, HLS packaging otherwise. Durations are resolved
//! through three tiers — in-process cache, durable store, bounded ffprobe —
//! and the response reports which tier answered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{PathMapping, VodConfig};
use crate::error::{AppError, Result};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VodMode {
    Hls,
    Mp4,
}

/// Which tier of the duration path answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationSource {
    Cache,
    Store,
    Probe,
}

/// The canonical VOD playback DTO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VodPlaybackResponse {
    /// Exactly `hls` or `mp4`
    #[serde(alias = "playback_type")]
    pub mode: VodMode,
    pub url: String,
    pub duration_seconds: f64,
    pub seekable: bool,
    pub reason: String,
    pub duration_source: DurationSource,
}

pub struct VodResolver {
    store: Arc<dyn StateStore>,
    ffprobe_bin: String,
    probe_timeout: Duration,
    mappings: Vec<PathMapping>,
    cache: Mutex<HashMap<String, f64>>,
}

impl VodResolver {
    pub fn new(
        store: Arc<dyn StateStore>,
        ffprobe_bin: String,
        vod: &VodConfig,
        mappings: Vec<PathMapping>,
    ) -> Self {
        Self {
            store,
            ffprobe_bin,
            probe_timeout: Duration::from_secs(vod.probe_timeout_secs),
            mappings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a recording id to its playback response
    pub async fn resolve(&self, recording_id: &str) -> Result<VodPlaybackResponse> {
        if recording_id.contains("..") || recording_id.contains('/') {
            return Err(AppError::BadRequest("invalid recording id".into()));
        }
        if self.mappings.is_empty() {
            return Err(AppError::Internal(
                "no recordingPathMappings configured".into(),
            ));
        }

        let path = self
            .locate(recording_id)
            .await
            .ok_or_else(|| AppError::VodNotFound(recording_id.to_string()))?;

        let (duration, source) = self.duration_for(recording_id, &path).await?;

        let is_mp4 = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("mp4"))
            .unwrap_or(false);

        let response = if is_mp4 {
            VodPlaybackResponse {
                mode: VodMode::Mp4,
                url: format!("/api/v3/recordings/{recording_id}/file"),
                duration_seconds: duration,
                seekable: true,
                reason: "container_direct".into(),
                duration_source: source,
            }
        } else {
            VodPlaybackResponse {
                mode: VodMode::Hls,
                url: format!("/api/v3/recordings/{recording_id}/hls/master.m3u8"),
                duration_seconds: duration,
                seekable: true,
                reason: "container_requires_packaging".into(),
                duration_source: source,
            }
        };
        Ok(response)
    }

    /// Rewrite a receiver-side absolute path through the configured mappings
    pub fn map_receiver_path(&self, receiver_path: &str) -> Option<PathBuf> {
        for mapping in &self.mappings {
            if let Some(rest) = receiver_path.strip_prefix(&mapping.from) {
                return Some(Path::new(&mapping.to).join(rest.trim_start_matches('/')));
            }
        }
        None
    }

    /// Find the recording file under the mapped local directories
    async fn locate(&self, recording_id: &str) -> Option<PathBuf> {
        for mapping in &self.mappings {
            let candidate = Path::new(&mapping.to).join(recording_id);
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                return Some(candidate);
            }
        }
        None
    }

    /// cache -> store -> probe, writing back on the way out
    async fn duration_for(&self, recording_id: &str, path: &Path) -> Result<(f64, DurationSource)> {
        if let Some(secs) = self.cache.lock().get(recording_id).copied() {
            return Ok((secs, DurationSource::Cache));
        }

        if let Some(secs) = self.store.get_vod_duration(recording_id).await? {
            self.cache.lock().insert(recording_id.to_string(), secs);
            return Ok((secs, DurationSource::Store));
        }

        let secs = self.probe_duration(path).await?;
        self.store.put_vod_duration(recording_id, secs).await?;
        self.cache.lock().insert(recording_id.to_string(), secs);
        Ok((secs, DurationSource::Probe))
    }

    /// Bounded ffprobe run extracting the container duration
    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = tokio::time::timeout(
            self.probe_timeout,
            tokio::process::Command::new(&self.ffprobe_bin)
                .args(["-v", "quiet", "-print_format", "json", "-show_format"])
                .arg(path)
                .output(),
        )
        .await
        .map_err(|_| AppError::ServiceUnavailable("media probe timed out".into()))??;

        if !output.status.success() {
            return Err(AppError::Internal(format!(
                "ffprobe failed with {}",
                output.status
            )));
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        json["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| AppError::Internal("ffprobe reported no duration".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn resolver_with(dir: &Path, store: Arc<dyn StateStore>) -> VodResolver {
        VodResolver::new(
            store,
            "ffprobe".into(),
            &VodConfig::default(),
            vec![PathMapping {
                from: "/hdd/movie".into(),
                to: dir.to_string_lossy().into_owned(),
            }],
        )
    }

    #[tokio::test]
    async fn missing_mapping_config_is_internal() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let resolver = VodResolver::new(store, "ffprobe".into(), &VodConfig::default(), vec![]);
        let err = resolver.resolve("rec.mp4").await.unwrap_err();
        assert_eq!(err.to_problem().status, 500);
        assert_eq!(err.to_problem().type_uri, "system/internal");
    }

    #[tokio::test]
    async fn unknown_recording_is_vod_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let resolver = resolver_with(dir.path(), store);
        let err = resolver.resolve("nope.mp4").await.unwrap_err();
        let problem = err.to_problem();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_uri, "vod/not-found");
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let resolver = resolver_with(dir.path(), store);
        assert!(resolver.resolve("../etc/passwd").await.is_err());
        assert!(resolver.resolve("a/b.mp4").await.is_err());
    }

    #[tokio::test]
    async fn mp4_is_direct_and_duration_comes_from_store() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("movie.mp4"), b"x")
            .await
            .unwrap();

        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        store.put_vod_duration("movie.mp4", 5400.0).await.unwrap();

        let resolver = resolver_with(dir.path(), store);
        let response = resolver.resolve("movie.mp4").await.unwrap();
        assert_eq!(response.mode, VodMode::Mp4);
        assert!(response.seekable);
        assert_eq!(response.duration_seconds, 5400.0);
        assert_eq!(response.duration_source, DurationSource::Store);

        // Second lookup is served from the in-process cache
        let again = resolver.resolve("movie.mp4").await.unwrap();
        assert_eq!(again.duration_source, DurationSource::Cache);
    }

    #[tokio::test]
    async fn ts_recordings_get_hls_packaging() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("rec.ts"), b"x").await.unwrap();

        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        store.put_vod_duration("rec.ts", 1800.0).await.unwrap();

        let resolver = resolver_with(dir.path(), store);
        let response = resolver.resolve("rec.ts").await.unwrap();
        assert_eq!(response.mode, VodMode::Hls);
        assert!(response.url.ends_with("master.m3u8"));
    }

    #[tokio::test]
    async fn receiver_paths_rewrite_through_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let resolver = resolver_with(dir.path(), store);
        let mapped = resolver.map_receiver_path("/hdd/movie/rec.ts").unwrap();
        assert_eq!(mapped, dir.path().join("rec.ts"));
        assert!(resolver.map_receiver_path("/elsewhere/rec.ts").is_none());
    }

    #[test]
    fn response_round_trip() {
        let response = VodPlaybackResponse {
            mode: VodMode::Mp4,
            url: "/api/v3/recordings/movie.mp4/file".into(),
            duration_seconds: 5400.0,
            seekable: true,
            reason: "container_direct".into(),
            duration_source: DurationSource::Probe,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"mode\":\"mp4\""));
        assert!(json.contains("\"durationSource\":\"probe\""));
        let back: VodPlaybackResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(response, back);
    }
}
