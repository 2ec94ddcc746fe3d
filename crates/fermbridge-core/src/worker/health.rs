//! Worker heartbeat and failure counters

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Liveness of one device worker, shared with the supervisor's watchdog
#[derive(Debug)]
pub struct WorkerHealth {
    last_heartbeat: Mutex<Instant>,
    consecutive_failures: AtomicU32,
    failed: AtomicBool,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self {
            last_heartbeat: Mutex::new(Instant::now()),
            consecutive_failures: AtomicU32::new(0),
            failed: AtomicBool::new(false),
        }
    }

    /// Record a successful loop iteration
    pub fn beat(&self) {
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check whether the last heartbeat is older than `threshold`
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat()) > threshold
    }

    /// Count a failed iteration; returns the new consecutive count
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// The worker gave up and stopped
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new()
    }
}
