//! Admission control
//!
//! Pure pre-acceptance check against configured capacity. Rules run in a
//! fixed order and fail closed: a runtime counter that makes no sense (any
//! negative value) denies with `ADMISSION_STATE_UNKNOWN` no matter what the
//! rest of the configuration says.

use crate::web::problem::Problem;

/// Capacity limits relevant to admission, snapshotted from config
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub engine_enabled: bool,
    pub max_sessions: i64,
    pub max_transcodes: i64,
}

/// Live counters sampled at request time
#[derive(Debug, Clone, Copy)]
pub struct RuntimeCounters {
    pub tuner_slots: i64,
    pub sessions_active: i64,
    pub transcodes_active: i64,
}

/// The admission-relevant part of a start intent
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest {
    pub wants_transcode: bool,
}

/// A denial with its stable code and the counters that produced it
#[derive(Debug, Clone)]
pub struct AdmissionDenied {
    pub code: &'static str,
    pub type_uri: &'static str,
    pub title: &'static str,
    pub current: i64,
    pub limit: i64,
}

impl AdmissionDenied {
    fn new(code: &'static str, type_uri: &'static str, title: &'static str) -> Self {
        Self {
            code,
            type_uri,
            title,
            current: 0,
            limit: 0,
        }
    }

    fn counters(mut self, current: i64, limit: i64) -> Self {
        self.current = current;
        self.limit = limit;
        self
    }

    pub fn to_problem(&self) -> Problem {
        Problem::new(self.type_uri, self.title, 503, self.code)
            .extra("current", self.current)
            .extra("limit", self.limit)
            .retry_after(5)
    }

    /// Denial for a resource-monitor pool with no preemptable holder
    pub fn pool_full(current: i64, limit: i64) -> Self {
        Self::new(
            "ADMISSION_SESSIONS_FULL",
            "admission/sessions-full",
            "Sessions Full",
        )
        .counters(current, limit)
    }
}

/// Evaluate the admission rules in order; `Ok(())` means admit
pub fn check(
    cfg: &AdmissionConfig,
    req: &AdmissionRequest,
    state: &RuntimeCounters,
) -> Result<(), AdmissionDenied> {
    if !cfg.engine_enabled {
        return Err(AdmissionDenied::new(
            "ADMISSION_ENGINE_DISABLED",
            "admission/engine-disabled",
            "Engine Disabled",
        ));
    }

    if state.tuner_slots <= 0 {
        return Err(AdmissionDenied::new(
            "ADMISSION_NO_TUNERS",
            "admission/no-tuners",
            "No Tuners",
        )
        .counters(state.tuner_slots, 0));
    }

    // Fail closed on counters that cannot be trusted
    if state.sessions_active < 0 || state.transcodes_active < 0 {
        return Err(AdmissionDenied::new(
            "ADMISSION_STATE_UNKNOWN",
            "admission/state-unknown",
            "Runtime State Unknown",
        )
        .counters(state.sessions_active.min(state.transcodes_active), 0));
    }

    if state.sessions_active >= cfg.max_sessions {
        return Err(AdmissionDenied::new(
            "ADMISSION_SESSIONS_FULL",
            "admission/sessions-full",
            "Sessions Full",
        )
        .counters(state.sessions_active, cfg.max_sessions));
    }

    if req.wants_transcode && state.transcodes_active >= cfg.max_transcodes {
        return Err(AdmissionDenied::new(
            "ADMISSION_TRANSCODES_FULL",
            "admission/transcodes-full",
            "Transcodes Full",
        )
        .counters(state.transcodes_active, cfg.max_transcodes));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> AdmissionConfig {
        AdmissionConfig {
            engine_enabled: true,
            max_sessions: 8,
            max_transcodes: 2,
        }
    }

    fn counters() -> RuntimeCounters {
        RuntimeCounters {
            tuner_slots: 2,
            sessions_active: 0,
            transcodes_active: 0,
        }
    }

    fn req(wants_transcode: bool) -> AdmissionRequest {
        AdmissionRequest { wants_transcode }
    }

    #[test]
    fn allows_when_capacity_is_free() {
        assert!(check(&cfg(), &req(true), &counters()).is_ok());
    }

    #[test]
    fn engine_disabled_wins_over_everything() {
        let mut c = cfg();
        c.engine_enabled = false;
        let denied = check(&c, &req(false), &counters()).unwrap_err();
        assert_eq!(denied.code, "ADMISSION_ENGINE_DISABLED");
    }

    #[test]
    fn no_tuners() {
        let mut state = counters();
        state.tuner_slots = 0;
        let denied = check(&cfg(), &req(false), &state).unwrap_err();
        assert_eq!(denied.code, "ADMISSION_NO_TUNERS");
    }

    #[test]
    fn negative_counters_fail_closed() {
        for (sessions, transcodes) in [(-1, 0), (0, -1), (-5, -5)] {
            let state = RuntimeCounters {
                tuner_slots: 2,
                sessions_active: sessions,
                transcodes_active: transcodes,
            };
            let denied = check(&cfg(), &req(false), &state).unwrap_err();
            assert_eq!(denied.code, "ADMISSION_STATE_UNKNOWN");
        }
    }

    #[test]
    fn sessions_full_carries_counters() {
        let mut state = counters();
        state.sessions_active = 8;
        let denied = check(&cfg(), &req(false), &state).unwrap_err();
        assert_eq!(denied.code, "ADMISSION_SESSIONS_FULL");
        assert_eq!(denied.current, 8);
        assert_eq!(denied.limit, 8);
        let body = denied.to_problem().body("req");
        assert_eq!(body["current"], 8);
        assert_eq!(body["limit"], 8);
    }

    #[test]
    fn transcodes_full_only_blocks_transcode_requests() {
        let mut state = counters();
        state.transcodes_active = 2;
        assert!(check(&cfg(), &req(false), &state).is_ok());
        let denied = check(&cfg(), &req(true), &state).unwrap_err();
        assert_eq!(denied.code, "ADMISSION_TRANSCODES_FULL");
    }
}
