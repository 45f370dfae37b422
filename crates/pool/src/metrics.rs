use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Pool health counters, incremented at the lifecycle points described in
/// the acquire/release contracts. Snapshots serialize to JSON for the
/// embedding server's stats surface.
#[derive(Default)]
pub struct PoolMetrics {
    contexts_created: AtomicU64,
    contexts_destroyed: AtomicU64,
    contexts_entered: AtomicU64,
    contexts_exited: AtomicU64,
    enter_failures: AtomicU64,
    creation_time_total_us: AtomicU64,
    creation_samples: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn note_created(&self, construction_time: Duration) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        self.creation_time_total_us
            .fetch_add(construction_time.as_micros() as u64, Ordering::Relaxed);
        self.creation_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_destroyed(&self) {
        self.contexts_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_entered(&self) {
        self.contexts_entered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_exited(&self) {
        self.contexts_exited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_enter_failure(&self) {
        self.enter_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::Relaxed)
    }

    pub fn contexts_destroyed(&self) -> u64 {
        self.contexts_destroyed.load(Ordering::Relaxed)
    }

    pub fn contexts_entered(&self) -> u64 {
        self.contexts_entered.load(Ordering::Relaxed)
    }

    pub fn contexts_exited(&self) -> u64 {
        self.contexts_exited.load(Ordering::Relaxed)
    }

    pub fn enter_failures(&self) -> u64 {
        self.enter_failures.load(Ordering::Relaxed)
    }

    pub fn avg_creation_ms(&self) -> f64 {
        let samples = self.creation_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        let total_us = self.creation_time_total_us.load(Ordering::Relaxed);
        total_us as f64 / 1000.0 / samples as f64
    }

    /// Get metrics as a JSON-serializable snapshot
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "contexts_created": self.contexts_created(),
            "contexts_destroyed": self.contexts_destroyed(),
            "contexts_entered": self.contexts_entered(),
            "contexts_exited": self.contexts_exited(),
            "enter_failures": self.enter_failures(),
            "avg_creation_ms": self.avg_creation_ms(),
        })
    }
}
