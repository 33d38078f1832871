//! Bus event types
//!
//! Every event that crosses the in-process bus. Session lifecycle events
//! drive the worker; contract/telemetry events feed observability sinks.

use serde::{Deserialize, Serialize};

use crate::store::types::{Reason, StopReason};

/// Events published on the bus
///
/// Tagged serialization keeps the wire form stable for an external broker:
/// ```json
/// {"topic": "session.start", "data": {"sessionId": "..."}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", content = "data")]
pub enum BusEvent {
    /// A session record was written and wants a worker
    #[serde(rename = "session.start", rename_all = "camelCase")]
    SessionStart { session_id: String },

    /// A stop was requested (user, preemption, lease loss or cleanup)
    #[serde(rename = "session.stop", rename_all = "camelCase")]
    SessionStop {
        session_id: String,
        stop_reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<Reason>,
    },

    /// A worker failed to renew its lease
    #[serde(rename = "lease.lost", rename_all = "camelCase")]
    LeaseLost {
        session_id: String,
        service_key: String,
    },

    /// Periodic pipeline progress beacon
    #[serde(rename = "pipeline.tick", rename_all = "camelCase")]
    PipelineTick {
        session_id: String,
        pipeline_state: String,
    },

    /// A client consumed a contract-relevant response
    #[serde(rename = "ui.contract.consumed", rename_all = "camelCase")]
    ContractConsumed { operation: String },

    /// The system denied a request on a fail-closed path
    #[serde(rename = "ui.failclosed", rename_all = "camelCase")]
    FailClosed { code: String, request_id: String },

    /// An error reached a client
    #[serde(rename = "ui.error", rename_all = "camelCase")]
    UiError {
        code: String,
        message: String,
        request_id: String,
    },
}

impl BusEvent {
    /// Topics the orchestrator consumes; telemetry topics are excluded so
    /// worker subscriptions skip them entirely
    pub const LIFECYCLE_TOPICS: &'static [&'static str] =
        &["session.start", "session.stop", "lease.lost"];

    /// Topic string, stable across releases
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session.start",
            Self::SessionStop { .. } => "session.stop",
            Self::LeaseLost { .. } => "lease.lost",
            Self::PipelineTick { .. } => "pipeline.tick",
            Self::ContractConsumed { .. } => "ui.contract.consumed",
            Self::FailClosed { .. } => "ui.failclosed",
            Self::UiError { .. } => "ui.error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_stable() {
        let event = BusEvent::SessionStart {
            session_id: "s1".into(),
        };
        assert_eq!(event.topic(), "session.start");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"topic\":\"session.start\""));
        assert!(json.contains("\"sessionId\":\"s1\""));
    }

    #[test]
    fn stop_event_round_trip() {
        let event = BusEvent::SessionStop {
            session_id: "s1".into(),
            stop_reason: StopReason::Cleanup,
            reason: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: BusEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, BusEvent::SessionStop { .. }));
    }
}
