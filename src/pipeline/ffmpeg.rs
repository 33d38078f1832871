//! ffmpeg pipeline backend
//!
//! Spawns one ffmpeg process per run, writing an HLS playlist into the
//! session's output directory. Stop escalates from a graceful kill request
//! to a hard kill after `kill_timeout_secs`.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use uuid::Uuid;

use super::{MediaPipeline, PipelineError, PipelineHealth, RunHandle, StreamMode, StreamSource, StreamSpec};
use crate::config::{Enigma2Config, FfmpegConfig};

pub struct FfmpegPipeline {
    cfg: FfmpegConfig,
    enigma2: Enigma2Config,
    runs: Mutex<HashMap<String, Child>>,
}

impl FfmpegPipeline {
    pub fn new(cfg: FfmpegConfig, enigma2: Enigma2Config) -> Self {
        Self {
            cfg,
            enigma2,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Input arguments for the spec's source
    fn input_args(&self, spec: &StreamSpec) -> Vec<String> {
        let mut args = Vec::new();
        match &spec.source {
            StreamSource::Tuner { id, .. } => {
                // Receiver streams need generous probing before the first PAT
                args.extend([
                    "-analyzeduration".into(),
                    self.enigma2.analyze_duration.to_string(),
                    "-probesize".into(),
                    self.enigma2.probe_size.to_string(),
                    "-i".into(),
                    crate::receiver::Enigma2Client::stream_url(&self.enigma2.base_url, id),
                ]);
            }
            StreamSource::Url { url } => {
                args.extend(["-i".into(), url.clone()]);
            }
            StreamSource::File { path } => {
                if spec.mode == StreamMode::Vod {
                    args.push("-re".into());
                }
                args.extend(["-i".into(), path.to_string_lossy().into_owned()]);
            }
        }
        args
    }

    /// HLS output arguments derived from the profile
    fn output_args(&self, spec: &StreamSpec) -> Vec<String> {
        let list_size = if spec.profile.dvr_window_seconds > 0 {
            (spec.profile.dvr_window_seconds / spec.segment_seconds.max(1)).max(1)
        } else {
            6
        };

        let mut args: Vec<String> = vec![
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "copy".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            spec.segment_seconds.to_string(),
            "-hls_list_size".into(),
            list_size.to_string(),
            "-hls_flags".into(),
            "delete_segments+append_list+independent_segments".into(),
        ];
        if spec.profile.low_latency {
            args.extend([
                "-lhls".into(),
                "1".into(),
                "-hls_init_time".into(),
                "1".into(),
            ]);
        }
        if let Some(device) = &self.cfg.vaapi_device {
            args.extend(["-vaapi_device".into(), device.clone()]);
        }
        args.push(
            spec.hls_dir
                .join("master.m3u8")
                .to_string_lossy()
                .into_owned(),
        );
        args
    }
}

#[async_trait]
impl MediaPipeline for FfmpegPipeline {
    async fn start(&self, spec: &StreamSpec) -> Result<RunHandle, PipelineError> {
        tokio::fs::create_dir_all(&spec.hls_dir).await?;

        let mut command = Command::new(&self.cfg.bin);
        command
            .arg("-hide_banner")
            .args(["-loglevel", "warning"])
            .args(self.input_args(spec))
            .args(self.output_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        tracing::info!(
            session_id = spec.session_id.as_str(),
            bin = self.cfg.bin.as_str(),
            "starting ffmpeg run"
        );

        let mut child = command
            .spawn()
            .map_err(|e| PipelineError::StartFailed(format!("spawn {}: {e}", self.cfg.bin)))?;

        // Catch immediate exits (bad args, missing input) before declaring
        // the run started
        if let Some(status) = child
            .try_wait()
            .map_err(|e| PipelineError::StartFailed(e.to_string()))?
        {
            return Err(PipelineError::StartFailed(format!(
                "ffmpeg exited immediately with {status}"
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        self.runs.lock().insert(run_id.clone(), child);
        Ok(RunHandle { run_id })
    }

    async fn stop(&self, handle: &RunHandle) -> Result<(), PipelineError> {
        let Some(mut child) = self.runs.lock().remove(&handle.run_id) else {
            // Already stopped or reaped; stop is idempotent
            return Ok(());
        };

        // Ask nicely, then escalate
        let _ = child.start_kill();
        match tokio::time::timeout(
            Duration::from_secs(self.cfg.kill_timeout_secs),
            child.wait(),
        )
        .await
        {
            Ok(Ok(status)) => {
                tracing::debug!(run_id = handle.run_id.as_str(), %status, "ffmpeg run stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(PipelineError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(PipelineError::StopTimeout)
            }
        }
    }

    async fn health(&self, handle: &RunHandle) -> PipelineHealth {
        let mut runs = self.runs.lock();
        match runs.get_mut(&handle.run_id) {
            None => PipelineHealth::Unknown,
            Some(child) => match child.try_wait() {
                Ok(None) => PipelineHealth::Running,
                Ok(Some(status)) => {
                    runs.remove(&handle.run_id);
                    PipelineHealth::Exited(status.code())
                }
                Err(_) => PipelineHealth::Unknown,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::Profile;
    use std::path::PathBuf;

    fn pipeline() -> FfmpegPipeline {
        FfmpegPipeline::new(FfmpegConfig::default(), Enigma2Config::default())
    }

    fn spec() -> StreamSpec {
        let mut profile = Profile::named("web_opt");
        profile.dvr_window_seconds = 120;
        StreamSpec {
            session_id: "sess_1".into(),
            source: StreamSource::Tuner {
                id: "1:0:19:A".into(),
                tuner_slot: 0,
            },
            mode: StreamMode::Live,
            profile,
            hls_dir: PathBuf::from("/tmp/hls/sessions/sess_1"),
            segment_seconds: 4,
        }
    }

    #[test]
    fn tuner_input_uses_stream_port_and_probe_budget() {
        let args = pipeline().input_args(&spec());
        let joined = args.join(" ");
        assert!(joined.contains("-analyzeduration 2000000"));
        assert!(joined.contains("http://127.0.0.1:8001/1:0:19:A"));
    }

    #[test]
    fn dvr_window_sets_list_size() {
        let args = pipeline().output_args(&spec());
        let joined = args.join(" ");
        // 120s window at 4s segments
        assert!(joined.contains("-hls_list_size 30"));
        assert!(joined.ends_with("master.m3u8"));
    }

    #[tokio::test]
    async fn stop_of_unknown_handle_is_idempotent() {
        let result = pipeline()
            .stop(&RunHandle {
                run_id: "gone".into(),
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn health_of_unknown_handle() {
        let health = pipeline()
            .health(&RunHandle {
                run_id: "gone".into(),
            })
            .await;
        assert_eq!(health, PipelineHealth::Unknown);
    }
}
