//! Request correlation
//!
//! Middleware assigns or echoes `X-Request-ID`, keeps it in a task-local for
//! the lifetime of the request, and stamps it on the response. Logs and
//! problem bodies read the task-local instead of threading the id through
//! every signature.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// The request id of the current request, if one is in scope
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Run `fut` with `id` as the ambient request id (used by background tasks
/// that act on behalf of a stored correlation id)
pub async fn with_request_id<F, T>(id: String, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_ID.scope(id, fut).await
}

/// Echo an inbound `X-Request-ID` or mint one, and stamp the response
pub async fn middleware(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = REQUEST_ID.scope(id.clone(), next.run(request)).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .entry(REQUEST_ID_HEADER)
            .or_insert(value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_exposes_id() {
        assert_eq!(current(), None);
        let seen = with_request_id("req-7".into(), async { current() }).await;
        assert_eq!(seen, Some("req-7".into()));
        assert_eq!(current(), None);
    }
}
