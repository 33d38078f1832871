use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::receiver::GuardedReceiver;
use crate::resources::ResourceMonitor;
use crate::store::StateStore;
use crate::vod::VodResolver;
use crate::web::HttpMetrics;

/// Application-wide state shared across handlers
///
/// Handlers never mutate shared data directly; session state changes flow
/// through the transactional store, and lifecycle signals go over the bus.
pub struct AppState {
    /// Immutable configuration snapshot, loaded once at startup
    pub config: Arc<AppConfig>,
    /// Transactional session/pipeline/lease store
    pub store: Arc<dyn StateStore>,
    /// In-process topic bus
    pub bus: Arc<EventBus>,
    /// Tuner pool and GPU tokens
    pub resources: Arc<ResourceMonitor>,
    /// Receiver adapter behind its circuit breaker
    pub receiver: Arc<GuardedReceiver>,
    /// VOD playback resolver
    pub vod: Arc<VodResolver>,
    /// HTTP-layer counters (panics per path)
    pub metrics: Arc<HttpMetrics>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        resources: Arc<ResourceMonitor>,
        receiver: Arc<GuardedReceiver>,
        vod: Arc<VodResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            bus,
            resources,
            receiver,
            vod,
            metrics: Arc::new(HttpMetrics::default()),
        })
    }
}
