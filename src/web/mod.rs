//! HTTP layer
//!
//! Routing, request correlation, scope enforcement, the problem writer and
//! the HLS origin. Panics in handlers are caught at the perimeter, counted
//! per path, and surfaced as 500 problems.

pub mod handlers;
pub mod hls;
pub mod problem;
pub mod request_id;
pub mod routes;

pub use routes::create_router;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use parking_lot::Mutex;

use crate::state::AppState;
use problem::Problem;

/// HTTP-layer counters
///
/// `xg2g_http_panics_total{path}` is the only metric the core exports
/// itself; everything else is derived from logs and events.
#[derive(Default)]
pub struct HttpMetrics {
    panics: Mutex<HashMap<String, u64>>,
}

impl HttpMetrics {
    pub fn record_panic(&self, path: &str) {
        *self.panics.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn total(&self) -> u64 {
        self.panics.lock().values().sum()
    }

    pub fn by_path(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<_> = self
            .panics
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort();
        entries
    }
}

/// Panic boundary for request handlers: recover, count, answer with a
/// problem instead of tearing down the connection
pub async fn catch_panic(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match std::panic::AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            state.metrics.record_panic(&path);
            tracing::error!(path = path.as_str(), "panic in request handler");
            Problem::new(
                "system/internal",
                "Internal Server Error",
                500,
                "R_INVARIANT_VIOLATION",
            )
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_counter_is_per_path() {
        let metrics = HttpMetrics::default();
        metrics.record_panic("/api/v3/intents");
        metrics.record_panic("/api/v3/intents");
        metrics.record_panic("/hls/x/master.m3u8");
        assert_eq!(metrics.total(), 3);
        assert_eq!(
            metrics.by_path(),
            vec![
                ("/api/v3/intents".to_string(), 2),
                ("/hls/x/master.m3u8".to_string(), 1)
            ]
        );
    }
}
