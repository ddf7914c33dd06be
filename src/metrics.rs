//! Injectable performance metrics.
//!
//! The collector is owned by the coordinator and passed into assembly, so
//! there is no process-wide mutable state. Workers record through a shared
//! reference; the lock is taken once per pass, not per element.
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<MetricsSnapshot>,
}

/// A point-in-time copy of the collected counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub residual_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub elements_visited: u64,
    pub faces_visited: u64,
    pub residual_time: Duration,
    pub jacobian_time: Duration,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_residual_evaluation(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.residual_evaluations += 1;
        inner.residual_time += elapsed;
    }

    pub fn record_jacobian_evaluation(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.jacobian_evaluations += 1;
        inner.jacobian_time += elapsed;
    }

    pub fn add_elements_visited(&self, count: u64) {
        self.inner.lock().elements_visited += count;
    }

    pub fn add_faces_visited(&self, count: u64) {
        self.inner.lock().faces_visited += count;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}
