//! RFC 7807 problem writer
//!
//! Every error response in the API is `application/problem+json` with a
//! stable `code` and the canonical `X-Request-ID`. Reserved fields can never
//! be overridden by extension members.

use std::collections::BTreeMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use super::request_id;

/// Content type for problem bodies
pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Reserved problem members; extension members with these names are dropped
const RESERVED_KEYS: &[&str] = &[
    "type",
    "title",
    "status",
    "code",
    "detail",
    "instance",
    "requestId",
];

/// A problem body under construction
#[derive(Debug, Clone)]
pub struct Problem {
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    pub code: String,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
    pub retry_after_secs: Option<u64>,
}

impl Problem {
    pub fn new(type_uri: &str, title: &str, status: u16, code: &str) -> Self {
        Self {
            type_uri: type_uri.to_string(),
            title: title.to_string(),
            status,
            code: code.to_string(),
            detail: None,
            instance: None,
            extra: BTreeMap::new(),
            retry_after_secs: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Attach an extension member. Reserved member names are ignored.
    pub fn extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if RESERVED_KEYS.contains(&key) {
            tracing::warn!(key, "problem extension tried to override a reserved member");
            return self;
        }
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Render the JSON body, stamping `request_id`
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("type".into(), self.type_uri.clone().into());
        map.insert("title".into(), self.title.clone().into());
        map.insert("status".into(), self.status.into());
        map.insert("code".into(), self.code.clone().into());
        if let Some(detail) = &self.detail {
            map.insert("detail".into(), detail.clone().into());
        }
        if let Some(instance) = &self.instance {
            map.insert("instance".into(), instance.clone().into());
        }
        map.insert("requestId".into(), request_id.into());
        for (key, value) in &self.extra {
            map.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(map)
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        // The middleware scopes the id around the whole request. A problem
        // written outside that scope is a contract violation: emit a fallback
        // token so the body stays well-formed, and log loudly.
        let request_id = request_id::current().unwrap_or_else(|| {
            let token = format!("fallback-{}", uuid::Uuid::new_v4());
            tracing::error!(
                fallback = token.as_str(),
                "problem written without a request id in scope"
            );
            token
        });

        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.body(&request_id).to_string();

        let mut response = Response::new(body.into());
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
