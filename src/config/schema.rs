use serde::{Deserialize, Serialize};

/// Main application configuration
///
/// Loaded once at startup and handed to every module as a snapshot. The
/// schema is closed-world: unknown keys anywhere in the document fail
/// startup instead of being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct AppConfig {
    /// Session engine settings
    pub engine: EngineConfig,
    /// Capacity limits
    pub limits: LimitsConfig,
    /// HLS packaging settings
    pub hls: HlsConfig,
    /// External transcoder settings
    pub ffmpeg: FfmpegConfig,
    /// Receiver adapter settings
    pub enigma2: Enigma2Config,
    /// Pipeline operation timeouts
    pub timeouts: TimeoutsConfig,
    /// Outbound network policy
    pub network: NetworkConfig,
    /// HTTP API settings
    pub api: ApiConfig,
    /// Worker/orchestrator settings
    pub worker: WorkerConfig,
    /// Sweeper settings
    pub sweeper: SweeperConfig,
    /// VOD resolver settings
    pub vod: VodConfig,
    /// Receiver-path to local-path rewrites for recordings
    pub recording_path_mappings: Vec<PathMapping>,
    /// Idempotency-key TTL in seconds
    pub idempotency_ttl_secs: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            limits: LimitsConfig::default(),
            hls: HlsConfig::default(),
            ffmpeg: FfmpegConfig::default(),
            enigma2: Enigma2Config::default(),
            timeouts: TimeoutsConfig::default(),
            network: NetworkConfig::default(),
            api: ApiConfig::default(),
            worker: WorkerConfig::default(),
            sweeper: SweeperConfig::default(),
            vod: VodConfig::default(),
            recording_path_mappings: Vec::new(),
            idempotency_ttl_secs: 60,
        }
    }
}

/// Session engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EngineConfig {
    /// Master switch; a disabled engine denies all intents
    pub enabled: bool,
    /// Tuner slot ids exposed by the receiver
    pub tuner_slots: Vec<u32>,
    /// Seconds a session may go without a heartbeat before it expires
    pub idle_timeout_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tuner_slots: vec![0],
            idle_timeout_secs: 300,
        }
    }
}

/// Capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions
    pub max_sessions: i64,
    /// Maximum concurrent transcodes
    pub max_transcodes: i64,
    /// Resource-monitor pool size
    pub max_pool: usize,
    /// GPU transcoder tokens
    pub gpu_tokens: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            max_transcodes: 2,
            max_pool: 4,
            gpu_tokens: 1,
        }
    }
}

/// HLS packaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct HlsConfig {
    /// Root directory; session output lives under `<root>/sessions/<id>/`
    pub root: String,
    /// DVR window in seconds
    pub dvr_window_secs: u32,
    /// Target segment duration in seconds
    pub segment_seconds: u32,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root: "/var/lib/xg2g/hls".into(),
            dvr_window_secs: 120,
            segment_seconds: 4,
        }
    }
}

/// External transcoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct FfmpegConfig {
    pub bin: String,
    pub ffprobe_bin: String,
    /// VAAPI render device, when hardware encoding is available
    pub vaapi_device: Option<String>,
    /// Seconds between SIGTERM and SIGKILL on stop
    pub kill_timeout_secs: u64,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            bin: "ffmpeg".into(),
            ffprobe_bin: "ffprobe".into(),
            vaapi_device: None,
            kill_timeout_secs: 5,
        }
    }
}

/// Receiver adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Enigma2Config {
    /// OpenWebif base URL, e.g. `http://receiver.local`
    pub base_url: String,
    /// ffmpeg `-analyzeduration` passed for receiver streams (microseconds)
    pub analyze_duration: u64,
    /// ffmpeg `-probesize` for receiver streams (bytes)
    pub probe_size: u64,
    /// Fall back to the raw :8001 stream port when OpenWebif zap fails
    pub fallback_to_8001: bool,
    /// Tune preflight timeout in seconds
    pub preflight_timeout_secs: u64,
}

impl Default for Enigma2Config {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1".into(),
            analyze_duration: 2_000_000,
            probe_size: 1_000_000,
            fallback_to_8001: true,
            preflight_timeout_secs: 5,
        }
    }
}

/// Pipeline operation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Seconds the packager may take to produce a first manifest
    pub transcode_start_secs: u64,
    /// Seconds without segment progress before a transcode counts as dead
    pub transcode_no_progress_secs: u64,
    /// Seconds a graceful pipeline stop may take before handing off
    pub pipeline_stop_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            transcode_start_secs: 10,
            transcode_no_progress_secs: 30,
            pipeline_stop_secs: 8,
        }
    }
}

/// Outbound network policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct NetworkConfig {
    pub outbound: OutboundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OutboundConfig {
    /// When disabled, no allowlist is enforced
    pub enabled: bool,
    pub allow: OutboundAllow,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow: OutboundAllow::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OutboundAllow {
    pub hosts: Vec<String>,
    pub cidrs: Vec<String>,
    pub ports: Vec<u16>,
    pub schemes: Vec<String>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Bearer tokens and the scopes they grant. An empty list disables
    /// authorization (single-user deployments).
    pub tokens: Vec<ApiToken>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiToken {
    pub token: String,
    pub scopes: Vec<String>,
}

/// Worker/orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    /// Lease TTL in seconds; heartbeats run at half of this
    pub lease_ttl_secs: i64,
    /// Concurrent pipeline starts across all sessions
    pub start_concurrency: usize,
    /// Concurrent pipeline stops across all sessions
    pub stop_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            start_concurrency: 2,
            stop_concurrency: 2,
        }
    }
}

/// Sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Seconds a terminal session is retained before deletion
    pub session_retention_secs: i64,
    /// Minimum age of an orphan HLS directory before removal
    pub file_retention_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            session_retention_secs: 900,
            file_retention_secs: 3600,
        }
    }
}

/// VOD resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct VodConfig {
    /// ffprobe budget in seconds
    pub probe_timeout_secs: u64,
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
        }
    }
}

/// Prefix rewrite from receiver-side recording paths to local mounts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert!(cfg.engine.enabled);
        assert_eq!(cfg.limits.max_sessions, 8);
        assert_eq!(cfg.idempotency_ttl_secs, 60);
        assert_eq!(cfg.worker.lease_ttl_secs, 30);
    }

    #[test]
    fn unknown_keys_fail_parsing() {
        let doc = r#"{"engine": {"enabled": true, "bogusKnob": 1}}"#;
        assert!(serde_json::from_str::<AppConfig>(doc).is_err());

        let doc = r#"{"totallyUnknown": {}}"#;
        assert!(serde_json::from_str::<AppConfig>(doc).is_err());
    }

    #[test]
    fn partial_documents_fill_defaults() {
        let doc = r#"{"limits": {"maxSessions": 2}}"#;
        let cfg: AppConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(cfg.limits.max_sessions, 2);
        assert_eq!(cfg.limits.max_transcodes, 2);
        assert_eq!(cfg.hls.segment_seconds, 4);
    }
}
