//! Resource monitor
//!
//! A bounded, priority-aware pool of session handles plus a counted set of
//! GPU transcoder tokens. Higher-priority arrivals may preempt the
//! lowest-priority, oldest-started active holder. CPU load is observed for
//! backpressure signals only; it never blocks a higher-priority request on
//! its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Session priority, strictly ordered: `Recording > Live > Pulse`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Pulse = 0,
    Live = 1,
    Recording = 2,
}

#[derive(Debug, Clone)]
struct Holder {
    session_id: String,
    priority: Priority,
    started_at: i64,
}

/// Outcome of an admission attempt against the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAdmit {
    /// Room in the pool; the session now holds a slot
    Admitted,
    /// A lower-priority holder was displaced; the caller must stop it
    Preempted { victim_session_id: String },
    /// Pool full of equal-or-higher priority holders
    Rejected,
}

/// RAII GPU token; dropping it returns the token to the pool
pub struct GpuToken {
    _permit: OwnedSemaphorePermit,
}

pub struct ResourceMonitor {
    max_pool: usize,
    holders: Mutex<HashMap<String, Holder>>,
    gpu: Arc<Semaphore>,
    /// Informational only, percent * 100
    observed_cpu_load: AtomicU32,
}

impl ResourceMonitor {
    pub fn new(max_pool: usize, gpu_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            max_pool,
            holders: Mutex::new(HashMap::new()),
            gpu: Arc::new(Semaphore::new(gpu_limit)),
            observed_cpu_load: AtomicU32::new(0),
        })
    }

    /// Try to admit `session_id` at `priority`.
    ///
    /// On `Preempted`, the victim's slot has already been transferred; the
    /// caller is responsible for publishing the victim's stop.
    pub fn admit(&self, session_id: &str, priority: Priority, now: i64) -> PoolAdmit {
        let mut holders = self.holders.lock();

        if holders.contains_key(session_id) {
            return PoolAdmit::Admitted;
        }

        if holders.len() < self.max_pool {
            holders.insert(
                session_id.to_string(),
                Holder {
                    session_id: session_id.to_string(),
                    priority,
                    started_at: now,
                },
            );
            return PoolAdmit::Admitted;
        }

        // Lowest priority first, oldest start breaks the tie
        let victim = holders
            .values()
            .filter(|h| h.priority < priority)
            .min_by_key(|h| (h.priority, h.started_at))
            .map(|h| h.session_id.clone());

        match victim {
            Some(victim_id) => {
                holders.remove(&victim_id);
                holders.insert(
                    session_id.to_string(),
                    Holder {
                        session_id: session_id.to_string(),
                        priority,
                        started_at: now,
                    },
                );
                PoolAdmit::Preempted {
                    victim_session_id: victim_id,
                }
            }
            None => PoolAdmit::Rejected,
        }
    }

    /// Return a slot to the pool; unknown ids are a no-op
    pub fn release(&self, session_id: &str) {
        self.holders.lock().remove(session_id);
    }

    pub fn active_count(&self) -> usize {
        self.holders.lock().len()
    }

    /// Non-blocking GPU token acquisition; `None` when saturated
    pub fn try_acquire_gpu(&self) -> Option<GpuToken> {
        self.gpu
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GpuToken { _permit: permit })
    }

    pub fn gpu_available(&self) -> usize {
        self.gpu.available_permits()
    }

    /// Record an observed CPU load sample (percent)
    pub fn observe_cpu_load(&self, percent: f32) {
        self.observed_cpu_load
            .store((percent * 100.0) as u32, Ordering::Relaxed);
    }

    pub fn cpu_load(&self) -> f32 {
        self.observed_cpu_load.load(Ordering::Relaxed) as f32 / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_pool_is_full() {
        let monitor = ResourceMonitor::new(2, 1);
        assert_eq!(monitor.admit("a", Priority::Live, 1), PoolAdmit::Admitted);
        assert_eq!(monitor.admit("b", Priority::Live, 2), PoolAdmit::Admitted);
        assert_eq!(monitor.admit("c", Priority::Live, 3), PoolAdmit::Rejected);
        monitor.release("a");
        assert_eq!(monitor.admit("c", Priority::Live, 4), PoolAdmit::Admitted);
    }

    #[test]
    fn recording_preempts_oldest_lowest_live() {
        let monitor = ResourceMonitor::new(4, 1);
        for (id, at) in [("l1", 10), ("l2", 5), ("l3", 20), ("l4", 15)] {
            assert_eq!(monitor.admit(id, Priority::Live, at), PoolAdmit::Admitted);
        }
        let outcome = monitor.admit("rec", Priority::Recording, 30);
        assert_eq!(
            outcome,
            PoolAdmit::Preempted {
                victim_session_id: "l2".into()
            }
        );
        assert_eq!(monitor.active_count(), 4);
    }

    #[test]
    fn pulse_loses_to_live_before_live_loses_to_live() {
        let monitor = ResourceMonitor::new(2, 1);
        monitor.admit("pulse", Priority::Pulse, 1);
        monitor.admit("live", Priority::Live, 2);
        let outcome = monitor.admit("rec", Priority::Recording, 3);
        assert_eq!(
            outcome,
            PoolAdmit::Preempted {
                victim_session_id: "pulse".into()
            }
        );
    }

    #[test]
    fn equal_priority_never_preempts() {
        let monitor = ResourceMonitor::new(1, 1);
        monitor.admit("a", Priority::Recording, 1);
        assert_eq!(
            monitor.admit("b", Priority::Recording, 2),
            PoolAdmit::Rejected
        );
    }

    #[test]
    fn gpu_tokens_are_non_blocking_and_raii() {
        let monitor = ResourceMonitor::new(1, 1);
        let token = monitor.try_acquire_gpu().expect("token available");
        assert!(monitor.try_acquire_gpu().is_none());
        drop(token);
        assert!(monitor.try_acquire_gpu().is_some());
    }

    #[test]
    fn cpu_load_is_informational() {
        let monitor = ResourceMonitor::new(1, 0);
        monitor.observe_cpu_load(87.5);
        assert!((monitor.cpu_load() - 87.5).abs() < 0.01);
        // Saturated CPU still admits
        assert_eq!(monitor.admit("a", Priority::Live, 1), PoolAdmit::Admitted);
    }
}
