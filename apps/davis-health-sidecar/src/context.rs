use serde::{Deserialize, Serialize};
use std::fmt;

/// Vendor credentials for one ingest cycle.
///
/// Built from configuration at the start of every cycle and dropped when the cycle
/// ends. Never written to the health store.
#[derive(Clone)]
pub struct CredentialContext {
    pub api_key: String,
    pub api_secret: String,
    pub station_id: String,
}

impl CredentialContext {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        station_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            station_id: station_id.into(),
        }
    }
}

// Keep the secret out of logs.
impl fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialContext")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("station_id", &self.station_id)
            .finish()
    }
}

/// Half-open archive interval `[start, end)` in epoch seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveWindow {
    pub start: i64,
    pub end: i64,
}

impl ArchiveWindow {
    /// `None` unless `end` is after `start` and the span fits in an `i64`.
    pub fn new(start: i64, end: i64) -> Option<Self> {
        match end.checked_sub(start) {
            Some(span) if span > 0 => Some(Self { start, end }),
            _ => None,
        }
    }

    /// The interval of `interval_secs` that closes at `end`.
    pub fn ending_at(end: i64, interval_secs: u64) -> Self {
        let interval = interval_secs.max(1) as i64;
        Self {
            start: end - interval,
            end,
        }
    }

    /// The most recent interval boundary-aligned window that has fully closed at `now`.
    pub fn last_closed(now: i64, interval_secs: u64) -> Self {
        let interval = interval_secs.max(1) as i64;
        let end = now.div_euclid(interval) * interval;
        Self::ending_at(end, interval_secs)
    }

    pub fn interval_secs(&self) -> i64 {
        self.end - self.start
    }

    /// Archive timestamp for the record; archive rows are stamped at interval close.
    pub fn date_time(&self) -> i64 {
        self.end
    }
}
