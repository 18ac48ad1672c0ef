use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct IngestStats {
    pub cycles_run: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub cycles_skipped: AtomicU64,
    pub last_cycle_unix: AtomicI64,
    pub last_record_unix: AtomicI64,
    pub consecutive_auth_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub last_cycle_unix: Option<i64>,
    pub last_record_unix: Option<i64>,
    pub consecutive_auth_failures: u64,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            last_cycle_unix: AtomicI64::new(0),
            last_record_unix: AtomicI64::new(0),
            consecutive_auth_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    /// Returns the new streak length.
    pub(in crate::ingest) fn note_auth_failure(&self) -> u64 {
        self.consecutive_auth_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(in crate::ingest) fn reset_auth_failures(&self) {
        self.consecutive_auth_failures.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let nonzero = |value: i64| (value != 0).then_some(value);
        StatsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            last_cycle_unix: nonzero(self.last_cycle_unix.load(Ordering::Relaxed)),
            last_record_unix: nonzero(self.last_record_unix.load(Ordering::Relaxed)),
            consecutive_auth_failures: self.consecutive_auth_failures.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}
