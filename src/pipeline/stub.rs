//! Stub pipeline backend
//!
//! Simulates the packager: writes a minimal playlist into the output
//! directory after a configurable delay, tracks run health in memory, and
//! can inject start failures or mid-run exits. Used by orchestration tests
//! and by dry-run deployments without ffmpeg installed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{MediaPipeline, PipelineError, PipelineHealth, RunHandle, StreamSpec};

#[derive(Debug, Clone)]
pub struct StubBehavior {
    /// Delay before the playlist appears
    pub start_latency: Duration,
    /// Fail every `start` call
    pub fail_start: bool,
    /// Exit code reported once [`StubPipeline::kill_run`] is called
    pub exit_code: i32,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            start_latency: Duration::from_millis(10),
            fail_start: false,
            exit_code: 0,
        }
    }
}

#[derive(Default)]
struct StubState {
    /// run_id -> exited
    runs: HashMap<String, bool>,
    started_specs: Vec<StreamSpec>,
}

#[derive(Default)]
pub struct StubPipeline {
    behavior: StubBehavior,
    state: Arc<Mutex<StubState>>,
}

impl StubPipeline {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            state: Arc::new(Mutex::new(StubState::default())),
        }
    }

    /// Specs seen by `start`, for assertions
    pub fn started_specs(&self) -> Vec<StreamSpec> {
        self.state.lock().started_specs.clone()
    }

    /// Simulate an unexpected process exit
    pub fn kill_run(&self, handle: &RunHandle) {
        if let Some(exited) = self.state.lock().runs.get_mut(&handle.run_id) {
            *exited = true;
        }
    }

    /// Simulate every active run dying at once
    pub fn kill_all(&self) {
        for exited in self.state.lock().runs.values_mut() {
            *exited = true;
        }
    }

    pub fn active_runs(&self) -> usize {
        self.state.lock().runs.values().filter(|e| !**e).count()
    }
}

#[async_trait]
impl MediaPipeline for StubPipeline {
    async fn start(&self, spec: &StreamSpec) -> Result<RunHandle, PipelineError> {
        if self.behavior.fail_start {
            return Err(PipelineError::StartFailed("injected start failure".into()));
        }

        tokio::fs::create_dir_all(&spec.hls_dir).await?;

        let run_id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock();
            state.runs.insert(run_id.clone(), false);
            state.started_specs.push(spec.clone());
        }

        // Fake packager warm-up, then a playable playlist
        let hls_dir = spec.hls_dir.clone();
        let latency = self.behavior.start_latency;
        let segment = spec.segment_seconds.max(1);
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let manifest = format!(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{segment}\n\
                 #EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:{segment}.0,\nseg00000.ts\n"
            );
            let _ = tokio::fs::write(hls_dir.join("master.m3u8"), manifest).await;
        });

        Ok(RunHandle { run_id })
    }

    async fn stop(&self, handle: &RunHandle) -> Result<(), PipelineError> {
        self.state.lock().runs.remove(&handle.run_id);
        Ok(())
    }

    async fn health(&self, handle: &RunHandle) -> PipelineHealth {
        match self.state.lock().runs.get(&handle.run_id) {
            None => PipelineHealth::Unknown,
            Some(true) => PipelineHealth::Exited(Some(self.behavior.exit_code)),
            Some(false) => PipelineHealth::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{StreamMode, StreamSource};
    use crate::store::types::Profile;

    fn spec(dir: &std::path::Path) -> StreamSpec {
        StreamSpec {
            session_id: "sess_1".into(),
            source: StreamSource::Url {
                url: "http://example/stream".into(),
            },
            mode: StreamMode::Live,
            profile: Profile::named("web_opt"),
            hls_dir: dir.to_path_buf(),
            segment_seconds: 4,
        }
    }

    #[tokio::test]
    async fn start_produces_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubPipeline::default();
        let handle = stub.start(&spec(dir.path())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let manifest = tokio::fs::read_to_string(dir.path().join("master.m3u8"))
            .await
            .unwrap();
        assert!(manifest.starts_with("#EXTM3U"));
        assert_eq!(stub.health(&handle).await, PipelineHealth::Running);
    }

    #[tokio::test]
    async fn injected_failure_and_exit() {
        let dir = tempfile::tempdir().unwrap();

        let failing = StubPipeline::new(StubBehavior {
            fail_start: true,
            ..StubBehavior::default()
        });
        assert!(failing.start(&spec(dir.path())).await.is_err());

        let stub = StubPipeline::default();
        let handle = stub.start(&spec(dir.path())).await.unwrap();
        stub.kill_run(&handle);
        assert_eq!(
            stub.health(&handle).await,
            PipelineHealth::Exited(Some(0))
        );
    }
}
