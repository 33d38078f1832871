//! HLS origin
//!
//! Thin facade over the session's on-disk HLS output. Manifest requests are
//! gated on session state: while the packager warms up the origin answers
//! with a minimal playlist so players keep polling instead of erroring out.
//! Actual file delivery is delegated to `tower-http`'s file service.

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tower_http::services::ServeFile;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::store::SessionState;
use crate::utils::is_safe_session_id;

/// Placeholder playlist served while the session is STARTING
const WARMUP_MANIFEST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n";

/// GET /hls/{sessionId}/{*path}
pub async fn origin(
    State(state): State<Arc<AppState>>,
    Path((session_id, rest)): Path<(String, String)>,
) -> Result<Response> {
    if !is_safe_session_id(&session_id) {
        return Err(AppError::NotFound("no such stream".into()));
    }

    // Segments and init fragments go straight to the file delegate;
    // only manifests consult session state
    if !rest.ends_with(".m3u8") {
        return serve_file(&state, &session_id, &rest).await;
    }

    let session = state.store.get_session(&session_id).await?;
    match session.map(|s| s.state) {
        None => Err(AppError::NotFound(format!("session {session_id}"))),
        Some(SessionState::Ready) => serve_file(&state, &session_id, &rest).await,
        Some(SessionState::Starting) | Some(SessionState::New) => Ok(warmup_manifest()),
        Some(SessionState::Failed) | Some(SessionState::Cancelled) => {
            Err(AppError::NotFound(format!("session {session_id} ended")))
        }
        Some(_) => Err(AppError::ServiceUnavailable("session is stopping".into())),
    }
}

fn warmup_manifest() -> Response {
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.apple.mpegurl"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        WARMUP_MANIFEST,
    )
        .into_response()
}

/// Delegate to the file service inside the session's directory
async fn serve_file(state: &AppState, session_id: &str, rest: &str) -> Result<Response> {
    let relative = sanitize(rest).ok_or_else(|| AppError::BadRequest("invalid path".into()))?;
    let path = FsPath::new(&state.config.hls.root)
        .join("sessions")
        .join(session_id)
        .join(relative);

    // ServeFile renders its own bare 404; pre-check so missing files keep
    // the problem-body contract
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(AppError::NotFound(format!("{rest} not found"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("{rest} not found")));
        }
        Err(e) => return Err(AppError::Io(e)),
    }

    let request = Request::builder()
        .uri("/")
        .body(Body::empty())
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let served = ServeFile::new(&path)
        .try_call(request)
        .await
        .map_err(AppError::Io)?;

    let mut response = served.map(Body::new);
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    // Players are picky about streaming types; pin the ones the packager
    // produces instead of trusting extension guessing
    if let Some(content_type) = hls_content_type(&path) {
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
    }
    Ok(response)
}

/// Reject any path component that could escape the session directory
fn sanitize(rest: &str) -> Option<PathBuf> {
    let path = FsPath::new(rest);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn hls_content_type(path: &FsPath) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => Some("application/vnd.apple.mpegurl"),
        Some("ts") => Some("video/mp2t"),
        Some("m4s") => Some("video/mp4"),
        _ => None,
    }
}
