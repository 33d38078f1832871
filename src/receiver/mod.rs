//! Receiver adapter
//!
//! Remote HTTP adapter for the set-top receiver (OpenWebif-style API). The
//! worker only sees the [`Receiver`] trait; the production implementation
//! talks HTTP and is wrapped in a circuit breaker so a sick receiver
//! degrades into fast 503s instead of stalled sessions.

pub mod breaker;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, Outcome};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Enigma2Config;

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("receiver request timed out")]
    Timeout,

    #[error("receiver circuit open")]
    CircuitOpen,

    #[error("receiver returned HTTP {0}")]
    Status(u16),

    #[error("receiver transport error: {0}")]
    Transport(String),

    /// The receiver answered but refused the zap
    #[error("tune rejected: {0}")]
    Rejected(String),

    #[error("request cancelled")]
    Cancelled,
}

impl ReceiverError {
    /// Stable reason code for session records and problems
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Timeout => "R_TUNE_TIMEOUT",
            _ => "R_TUNE_FAILED",
        }
    }

    /// Breaker outcome classification; capacity/cancel outcomes are neutral
    pub fn breaker_outcome(&self) -> Outcome {
        match self {
            Self::Timeout | Self::Status(_) | Self::Transport(_) => Outcome::TechnicalFailure,
            Self::Rejected(_) | Self::Cancelled | Self::CircuitOpen => Outcome::Neutral,
        }
    }
}

#[async_trait]
pub trait Receiver: Send + Sync {
    /// Tune `slot` to `service_ref`; must complete within the preflight
    /// budget or fail
    async fn tune(&self, slot: u32, service_ref: &str) -> Result<(), ReceiverError>;

    /// Cheap liveness probe used by deep health checks
    async fn ping(&self) -> Result<(), ReceiverError>;
}

/// HTTP client against an enigma2/OpenWebif receiver
pub struct Enigma2Client {
    http: reqwest::Client,
    base_url: String,
    fallback_to_8001: bool,
}

impl Enigma2Client {
    pub fn new(cfg: &Enigma2Config) -> Result<Self, ReceiverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.preflight_timeout_secs))
            .build()
            .map_err(|e| ReceiverError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            fallback_to_8001: cfg.fallback_to_8001,
        })
    }

    /// Raw stream port URL for a service, used as zap fallback and as the
    /// pipeline input
    pub fn stream_url(base_url: &str, service_ref: &str) -> String {
        let host = base_url
            .trim_end_matches('/')
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        let host = host.split(':').next().unwrap_or(host);
        format!("http://{host}:8001/{service_ref}")
    }

    fn classify(err: reqwest::Error) -> ReceiverError {
        if err.is_timeout() {
            ReceiverError::Timeout
        } else if let Some(status) = err.status() {
            ReceiverError::Status(status.as_u16())
        } else {
            ReceiverError::Transport(err.to_string())
        }
    }

    async fn zap(&self, service_ref: &str) -> Result<(), ReceiverError> {
        let url = format!("{}/web/zap?sRef={}", self.base_url, service_ref);
        let response = self.http.get(&url).send().await.map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReceiverError::Status(status.as_u16()));
        }
        let body = response.text().await.map_err(Self::classify)?;
        // OpenWebif answers 200 with an XML result flag
        if body.contains("<e2state>false</e2state>") {
            return Err(ReceiverError::Rejected("zap refused by receiver".into()));
        }
        Ok(())
    }

    /// Probe the raw stream port; some boxes tune lazily on first read
    async fn probe_stream_port(&self, service_ref: &str) -> Result<(), ReceiverError> {
        let url = Self::stream_url(&self.base_url, service_ref);
        let response = self.http.head(&url).send().await.map_err(Self::classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReceiverError::Status(response.status().as_u16()))
        }
    }
}

#[async_trait]
impl Receiver for Enigma2Client {
    async fn tune(&self, slot: u32, service_ref: &str) -> Result<(), ReceiverError> {
        tracing::debug!(slot, service_ref, "tuning receiver");
        match self.zap(service_ref).await {
            Ok(()) => Ok(()),
            Err(err) if self.fallback_to_8001 => {
                tracing::debug!(error = %err, "zap failed, probing stream port");
                self.probe_stream_port(service_ref).await.map_err(|_| err)
            }
            Err(err) => Err(err),
        }
    }

    async fn ping(&self) -> Result<(), ReceiverError> {
        let url = format!("{}/web/about", self.base_url);
        let response = self.http.get(&url).send().await.map_err(Self::classify)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ReceiverError::Status(response.status().as_u16()))
        }
    }
}

/// Circuit-breaker wrapper; the worker always talks to the receiver
/// through this guard
pub struct GuardedReceiver {
    inner: Arc<dyn Receiver>,
    breaker: CircuitBreaker,
}

impl GuardedReceiver {
    pub fn new(inner: Arc<dyn Receiver>, cfg: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(cfg),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn guarded<F, Fut>(&self, call: F) -> Result<(), ReceiverError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), ReceiverError>>,
    {
        if !self.breaker.allow() {
            return Err(ReceiverError::CircuitOpen);
        }
        let result = call().await;
        match &result {
            Ok(()) => self.breaker.record(Outcome::Success),
            Err(err) => self.breaker.record(err.breaker_outcome()),
        }
        result
    }
}

#[async_trait]
impl Receiver for GuardedReceiver {
    async fn tune(&self, slot: u32, service_ref: &str) -> Result<(), ReceiverError> {
        self.guarded(|| self.inner.tune(slot, service_ref)).await
    }

    async fn ping(&self) -> Result<(), ReceiverError> {
        self.guarded(|| self.inner.ping()).await
    }
}
