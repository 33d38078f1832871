//! Configuration loading
//!
//! The configuration is read exactly once at startup and passed to every
//! other module as an immutable snapshot. This module is the only place in
//! the crate that touches the process environment.

pub mod schema;

pub use schema::{
    ApiConfig, ApiToken, AppConfig, EngineConfig, Enigma2Config, FfmpegConfig, HlsConfig,
    LimitsConfig, NetworkConfig, PathMapping, SweeperConfig, TimeoutsConfig, VodConfig,
    WorkerConfig,
};

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Environment variable naming the config file
pub const ENV_CONFIG: &str = "XG2G_CONFIG";
/// Environment variable naming the data directory
pub const ENV_DATA: &str = "XG2G_DATA";

const DEFAULT_DATA_DIR: &str = "/var/lib/xg2g";

/// Resolve the config file path: CLI flag, then `XG2G_CONFIG`, then none
pub fn resolve_config_path(cli: Option<PathBuf>) -> Option<PathBuf> {
    cli.or_else(|| std::env::var(ENV_CONFIG).ok().map(PathBuf::from))
}

/// Resolve the data directory: CLI flag, then `XG2G_DATA`, then the default
pub fn resolve_data_dir(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var(ENV_DATA).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Load the configuration document.
///
/// A missing path yields the defaults. Unknown keys anywhere in the document
/// are a startup failure, not a warning.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path else {
        return Ok(AppConfig::default());
    };

    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("cannot read {}: {e}", path.display()))
    })?;

    serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("invalid config {}: {e}", path.display())))
}

/// Validate cross-field constraints that serde cannot express
pub fn validate(cfg: &AppConfig) -> Result<()> {
    if cfg.worker.lease_ttl_secs < 2 {
        return Err(AppError::Config("worker.leaseTtlSecs must be at least 2".into()));
    }
    if cfg.hls.segment_seconds == 0 {
        return Err(AppError::Config("hls.segmentSeconds must be positive".into()));
    }
    if cfg.engine.enabled && cfg.engine.tuner_slots.is_empty() {
        return Err(AppError::Config(
            "engine.tunerSlots must name at least one slot when the engine is enabled".into(),
        ));
    }
    for mapping in &cfg.recording_path_mappings {
        if mapping.from.is_empty() || mapping.to.is_empty() {
            return Err(AppError::Config("recordingPathMappings entries must be non-empty".into()));
        }
    }
    if cfg.network.outbound.enabled
        && !crate::utils::outbound_allowed(&cfg.enigma2.base_url, &cfg.network.outbound.allow)
    {
        return Err(AppError::Config(format!(
            "enigma2.baseUrl {} is not covered by network.outbound.allow",
            cfg.enigma2.base_url
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_path_yields_defaults() {
        let cfg = load(None).unwrap();
        assert!(cfg.engine.enabled);
    }

    #[test]
    fn unknown_key_fails_startup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"surpriseKnob": true}}"#).unwrap();
        assert!(load(Some(file.path())).is_err());
    }

    #[test]
    fn valid_document_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"engine": {{"enabled": true, "tunerSlots": [0, 1]}}, "api": {{"listenAddr": "127.0.0.1:9000"}}}}"#
        )
        .unwrap();
        let cfg = load(Some(file.path())).unwrap();
        assert_eq!(cfg.engine.tuner_slots, vec![0, 1]);
        assert_eq!(cfg.api.listen_addr, "127.0.0.1:9000");
        validate(&cfg).unwrap();
    }

    #[test]
    fn validation_rejects_enabled_engine_without_tuners() {
        let mut cfg = AppConfig::default();
        cfg.engine.tuner_slots.clear();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn outbound_policy_gates_receiver_url() {
        let mut cfg = AppConfig::default();
        cfg.network.outbound.enabled = true;
        cfg.network.outbound.allow.hosts = vec!["receiver.local".into()];
        cfg.enigma2.base_url = "http://elsewhere".into();
        assert!(validate(&cfg).is_err());

        cfg.enigma2.base_url = "http://receiver.local".into();
        validate(&cfg).unwrap();
    }
}
