//! Circuit breaker for the receiver adapter
//!
//! Sliding window of `(attempts, technical failures)`. The breaker trips
//! when failures reach the threshold AND enough attempts were seen; after
//! `reset_timeout` it half-opens, a run of consecutive successes closes it,
//! and any failure while half-open re-opens it immediately. Capacity and
//! cancellation outcomes are neutral: they never count as failures.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sliding window length
    pub window: Duration,
    /// Technical failures needed to trip
    pub failure_threshold: u32,
    /// Minimum attempts in the window before tripping is possible
    pub min_attempts: u32,
    /// Open -> half-open delay
    pub reset_timeout: Duration,
    /// Consecutive half-open successes needed to close
    pub successes_to_close: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_threshold: 5,
            min_attempts: 8,
            reset_timeout: Duration::from_secs(30),
            successes_to_close: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// How a guarded call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Transport/timeout/5xx class problems
    TechnicalFailure,
    /// Capacity or cancellation; ignored by the trip logic
    Neutral,
}

struct Inner {
    state: BreakerState,
    /// (when, was_technical_failure)
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
}

pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state != BreakerState::Open
    }

    /// Record the outcome of a permitted call
    pub fn record(&self, outcome: Outcome) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);

        match inner.state {
            BreakerState::Closed => {
                if outcome != Outcome::Neutral {
                    inner
                        .window
                        .push_back((now, outcome == Outcome::TechnicalFailure));
                }
                self.prune(&mut inner, now);

                let attempts = inner.window.len() as u32;
                let failures = inner.window.iter().filter(|(_, f)| *f).count() as u32;
                if failures >= self.cfg.failure_threshold && attempts >= self.cfg.min_attempts {
                    tracing::warn!(failures, attempts, "receiver circuit tripped open");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.window.clear();
                }
            }
            BreakerState::HalfOpen => match outcome {
                Outcome::Success => {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.cfg.successes_to_close {
                        tracing::info!("receiver circuit closed");
                        inner.state = BreakerState::Closed;
                        inner.opened_at = None;
                        inner.half_open_successes = 0;
                    }
                }
                Outcome::TechnicalFailure => {
                    tracing::warn!("receiver circuit re-opened from half-open");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.half_open_successes = 0;
                }
                Outcome::Neutral => {}
            },
            // A racing call may still report after the trip; ignore it
            BreakerState::Open => {}
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.cfg.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                }
            }
        }
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.cfg.window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }
}
