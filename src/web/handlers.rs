//! API handlers
//!
//! Intent lifecycle, session projection, heartbeats, VOD playback info and
//! system health. Handlers validate, consult the pure engines (decision,
//! admission), write through the store and signal the worker over the bus;
//! they never drive the pipeline themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use super::request_id;
use crate::admission::{self, AdmissionConfig, AdmissionDenied, AdmissionRequest, RuntimeCounters};
use crate::decision::{self, DecisionMode, DecisionOutput};
use crate::error::{AppError, Result};
use crate::events::BusEvent;
use crate::receiver::Receiver;
use crate::resources::{PoolAdmit, Priority};
use crate::state::AppState;
use crate::store::types::{Profile, SessionRecord, StopReason};
use crate::store::Update;
use crate::utils::new_session_id;

// ============================================================================
// Intents
// ============================================================================

/// POST /api/v3/intents
pub async fn create_intent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response> {
    let Value::Object(mut map) = body else {
        return Err(AppError::BadRequest("intent body must be an object".into()));
    };

    let service_ref = match map.remove("serviceRef") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(AppError::BadRequest("serviceRef is required".into())),
    };
    let profile = parse_profile(map.remove("profile"))?;
    let idempotency_key = match map.remove("idempotencyKey") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(_) => return Err(AppError::BadRequest("idempotencyKey must be a string".into())),
    };
    let priority = parse_priority(map.remove("priority"))?;

    // Whatever remains must be decision inputs under the closed-world schema
    let decision = match decision::parse_inputs(&Value::Object(map))? {
        Some(inputs) => Some(decision::decide(&inputs)?),
        None => None,
    };

    if let Some(out) = &decision {
        if out.mode == DecisionMode::Deny {
            state.bus.publish(BusEvent::ContractConsumed {
                operation: "createIntent".into(),
            });
            return Ok((StatusCode::OK, Json(json!({ "decision": out }))).into_response());
        }
    }

    // Idempotent replay: same key within TTL returns the same ticket and
    // emits no second event
    if let Some(key) = &idempotency_key {
        if let Some(existing) = state.store.get_idempotency(key).await? {
            tracing::debug!(idempotency_key = key.as_str(), session_id = existing.as_str(), "intent replay");
            return Ok(accepted_body(&existing, decision.as_ref()));
        }
    }

    admit(&state, decision.as_ref())?;

    let session_id = new_session_id();
    pool_admit(&state, &session_id, priority)?;

    let record = SessionRecord::new(
        session_id.clone(),
        service_ref,
        profile,
        request_id::current().unwrap_or_default(),
        state.config.engine.idle_timeout_secs,
        heartbeat_interval(state.config.engine.idle_timeout_secs),
    );
    state.store.put_session(&record).await?;
    if let Some(key) = &idempotency_key {
        state
            .store
            .put_idempotency(key, &session_id, state.config.idempotency_ttl_secs)
            .await?;
    }

    state.bus.publish(BusEvent::SessionStart {
        session_id: session_id.clone(),
    });
    state.bus.publish(BusEvent::ContractConsumed {
        operation: "createIntent".into(),
    });
    tracing::info!(session_id = session_id.as_str(), "intent accepted");

    Ok(accepted_body(&session_id, decision.as_ref()))
}

fn accepted_body(session_id: &str, decision: Option<&DecisionOutput>) -> Response {
    let mut body = json!({ "sessionId": session_id, "state": "STARTING" });
    if let Some(decision) = decision {
        body["decision"] = serde_json::to_value(decision).unwrap_or(Value::Null);
    }
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

fn parse_profile(value: Option<Value>) -> Result<Profile> {
    match value {
        None | Some(Value::Null) => Ok(Profile::named("default")),
        Some(Value::String(name)) if !name.is_empty() => Ok(Profile::named(&name)),
        Some(obj @ Value::Object(_)) => serde_json::from_value(obj)
            .map_err(|e| AppError::BadRequest(format!("invalid profile: {e}"))),
        Some(_) => Err(AppError::BadRequest("invalid profile".into())),
    }
}

fn parse_priority(value: Option<Value>) -> Result<Priority> {
    match value.as_ref().and_then(Value::as_str) {
        None => Ok(Priority::Live),
        Some("live") => Ok(Priority::Live),
        Some("recording") => Ok(Priority::Recording),
        Some("pulse") => Ok(Priority::Pulse),
        Some(other) => Err(AppError::BadRequest(format!("unknown priority `{other}`"))),
    }
}

fn heartbeat_interval(idle_timeout_secs: i64) -> u32 {
    ((idle_timeout_secs / 3).max(5)) as u32
}

/// Configured-capacity admission; fail closed on nonsense counters
fn admit(state: &AppState, decision: Option<&DecisionOutput>) -> Result<()> {
    let cfg = AdmissionConfig {
        engine_enabled: state.config.engine.enabled,
        max_sessions: state.config.limits.max_sessions,
        max_transcodes: state.config.limits.max_transcodes,
    };
    let req = AdmissionRequest {
        wants_transcode: matches!(decision.map(|d| d.mode), Some(DecisionMode::Transcode)),
    };
    let counters = RuntimeCounters {
        tuner_slots: state.config.engine.tuner_slots.len() as i64,
        sessions_active: state.resources.active_count() as i64,
        transcodes_active: state.config.limits.gpu_tokens as i64
            - state.resources.gpu_available() as i64,
    };

    if let Err(denied) = admission::check(&cfg, &req, &counters) {
        publish_fail_closed(state, denied.code);
        return Err(AppError::Admission(denied));
    }
    Ok(())
}

/// Priority pool admission; a preempted victim is stopped with CLEANUP
fn pool_admit(state: &AppState, session_id: &str, priority: Priority) -> Result<()> {
    match state
        .resources
        .admit(session_id, priority, Utc::now().timestamp())
    {
        PoolAdmit::Admitted => Ok(()),
        PoolAdmit::Preempted { victim_session_id } => {
            tracing::info!(
                victim = victim_session_id.as_str(),
                session_id,
                "preempting lower-priority session"
            );
            state.bus.publish(BusEvent::SessionStop {
                session_id: victim_session_id,
                stop_reason: StopReason::Cleanup,
                reason: None,
            });
            Ok(())
        }
        PoolAdmit::Rejected => {
            publish_fail_closed(state, "ADMISSION_SESSIONS_FULL");
            let limit = state.config.limits.max_pool as i64;
            Err(AppError::Admission(AdmissionDenied::pool_full(limit, limit)))
        }
    }
}

fn publish_fail_closed(state: &AppState, code: &str) {
    state.bus.publish(BusEvent::FailClosed {
        code: code.to_string(),
        request_id: request_id::current().unwrap_or_default(),
    });
}

// ============================================================================
// Sessions
// ============================================================================

/// GET /api/v3/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>> {
    match state.store.get_session(&session_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound(format!("session {session_id}"))),
    }
}

/// POST /api/v3/sessions/{id}/heartbeat
pub async fn heartbeat_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let now = Utc::now().timestamp();
    let idle = state.config.engine.idle_timeout_secs;

    #[derive(PartialEq)]
    enum Blocked {
        No,
        Terminal,
        LeaseGone,
    }
    let mut blocked = Blocked::No;

    let updated = state
        .store
        .update_session(&session_id, &mut |record| {
            if record.state.is_terminal() {
                blocked = Blocked::Terminal;
                return Update::Abort;
            }
            if matches!(record.lease_expires_at, Some(t) if t <= now) {
                blocked = Blocked::LeaseGone;
                return Update::Abort;
            }
            record.last_heartbeat = Some(now);
            record.expires_at = now + idle;
            Update::Apply
        })
        .await?;

    let Some(record) = updated else {
        return Err(AppError::NotFound(format!("session {session_id}")));
    };
    match blocked {
        Blocked::Terminal => Err(AppError::Gone(format!(
            "session {session_id} is {}",
            record.state.as_str()
        ))),
        Blocked::LeaseGone => Err(AppError::Gone(format!(
            "lease for session {session_id} expired"
        ))),
        Blocked::No => Ok(Json(json!({ "leaseExpiresAt": record.lease_expires_at })).into_response()),
    }
}

/// DELETE /api/v3/sessions/{id}
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response> {
    let Some(record) = state.store.get_session(&session_id).await? else {
        return Err(AppError::NotFound(format!("session {session_id}")));
    };
    if record.state.is_terminal() {
        return Err(AppError::Gone(format!(
            "session {session_id} already {}",
            record.state.as_str()
        )));
    }

    state.bus.publish(BusEvent::SessionStop {
        session_id: session_id.clone(),
        stop_reason: StopReason::UserStopped,
        reason: None,
    });
    tracing::info!(session_id = session_id.as_str(), "stop requested");

    Ok((StatusCode::ACCEPTED, Json(json!({ "sessionId": session_id }))).into_response())
}

// ============================================================================
// Recordings
// ============================================================================

/// GET /api/v3/recordings/{id}/playbackinfo
pub async fn get_playback_info(
    State(state): State<Arc<AppState>>,
    Path(recording_id): Path<String>,
) -> Result<Response> {
    let response = state.vod.resolve(&recording_id).await?;
    state.bus.publish(BusEvent::ContractConsumed {
        operation: "getPlaybackInfo".into(),
    });
    Ok(Json(response).into_response())
}

// ============================================================================
// System
// ============================================================================

/// GET /api/v3/system/health
pub async fn system_health(State(state): State<Arc<AppState>>) -> Result<Response> {
    // Liveness == the store answers
    if let Err(e) = state.store.get_session("health-probe").await {
        tracing::error!(error = %e, "health probe failed");
        return Err(AppError::ServiceUnavailable("state store unreachable".into()));
    }
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}

/// GET /api/v3/system/status?check_receiver=true
pub async fn system_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response> {
    let check_receiver = params
        .get("check_receiver")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    let mut status = "ok";
    let mut receiver_ok = None;

    if check_receiver {
        let ping = tokio::time::timeout(Duration::from_secs(3), state.receiver.ping()).await;
        let ok = matches!(ping, Ok(Ok(())));
        if !ok {
            status = "degraded";
        }
        receiver_ok = Some(ok);
    }

    Ok(Json(json!({
        "status": status,
        "receiver": receiver_ok,
        "breaker": state.receiver.breaker_state().as_str(),
        "cpuLoad": state.resources.cpu_load(),
        "sessionsActive": state.resources.active_count(),
        "events": state.bus.topic_counts(),
        "panics": state.metrics.total(),
    }))
    .into_response())
}

// ============================================================================
// Legacy shims
// ============================================================================

/// GET /lineup.json and friends: permanent redirect into the versioned API
pub async fn legacy_lineup() -> Redirect {
    Redirect::permanent("/api/v1/lineup.json")
}

pub async fn legacy_discover() -> Redirect {
    Redirect::permanent("/api/v1/discover.json")
}

pub async fn legacy_lineup_status() -> Redirect {
    Redirect::permanent("/api/v1/lineup_status.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_parsing_accepts_string_and_object() {
        assert_eq!(parse_profile(None).unwrap().name, "default");
        assert_eq!(
            parse_profile(Some(json!("web_opt"))).unwrap().name,
            "web_opt"
        );
        let profile = parse_profile(Some(json!({
            "name": "lowlat",
            "lowLatency": true,
            "dvrWindowSeconds": 60
        })))
        .unwrap();
        assert!(profile.low_latency);
        assert_eq!(profile.dvr_window_seconds, 60);
        assert!(parse_profile(Some(json!(42))).is_err());
    }

    #[test]
    fn priority_parsing() {
        assert_eq!(parse_priority(None).unwrap(), Priority::Live);
        assert_eq!(
            parse_priority(Some(json!("recording"))).unwrap(),
            Priority::Recording
        );
        assert!(parse_priority(Some(json!("vip"))).is_err());
    }

    #[test]
    fn heartbeat_interval_has_floor() {
        assert_eq!(heartbeat_interval(300), 100);
        assert_eq!(heartbeat_interval(6), 5);
    }
}
