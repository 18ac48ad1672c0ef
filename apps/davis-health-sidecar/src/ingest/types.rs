use crate::record::HealthRecord;
use crate::store::PersistFailure;
use crate::weatherlink::ApiFailure;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Normalizing,
    Persisting,
    Done,
    Failed,
}

#[derive(Debug, Error)]
pub enum CycleFailure {
    #[error("no health data for the interval (current: {current}; historical: {historical})")]
    NoData {
        current: ApiFailure,
        historical: ApiFailure,
    },
    #[error("WeatherLink rejected the credentials: {0}")]
    Auth(ApiFailure),
    #[error(transparent)]
    Persist(#[from] PersistFailure),
}

impl CycleFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleFailure::NoData { .. } => "no_data",
            CycleFailure::Auth(_) => "auth",
            CycleFailure::Persist(_) => "persist",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The archive event arrived too long after its window closed.
    StaleEvent { lag_secs: i64 },
    /// Both fetches failed and the slot already holds a row.
    PriorRowKept,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Done {
        record: HealthRecord,
        replaced: bool,
        /// At least one fetch failed and its fields are null.
        partial: bool,
    },
    Skipped {
        date_time: i64,
        reason: SkipReason,
    },
    Failed {
        date_time: i64,
        /// State the cycle was in when it failed.
        during: CycleState,
        /// The record written despite the failure, if any.
        persisted: Option<HealthRecord>,
        failure: CycleFailure,
    },
}

impl CycleOutcome {
    pub fn date_time(&self) -> i64 {
        match self {
            CycleOutcome::Done { record, .. } => record.date_time,
            CycleOutcome::Skipped { date_time, .. } | CycleOutcome::Failed { date_time, .. } => {
                *date_time
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, CycleOutcome::Failed { .. })
    }

    pub fn failure(&self) -> Option<&CycleFailure> {
        match self {
            CycleOutcome::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// JSON status returned to whoever triggered the cycle.
    pub fn to_json(&self) -> JsonValue {
        match self {
            CycleOutcome::Done {
                record,
                replaced,
                partial,
            } => json!({
                "status": "done",
                "dateTime": record.date_time,
                "replaced": replaced,
                "partial": partial,
                "record": record,
            }),
            CycleOutcome::Skipped { date_time, reason } => json!({
                "status": "skipped",
                "dateTime": date_time,
                "skip": reason,
            }),
            CycleOutcome::Failed {
                date_time,
                during,
                persisted,
                failure,
            } => json!({
                "status": "failed",
                "dateTime": date_time,
                "during": during,
                "kind": failure.kind(),
                "error": failure.to_string(),
                "record": persisted,
            }),
        }
    }
}
