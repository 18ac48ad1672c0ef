use super::types::{CycleFailure, CycleOutcome, CycleState, SkipReason};
use super::HealthIngestor;
use crate::context::{ArchiveWindow, CredentialContext};
use crate::normalize::normalize;
use crate::record::HealthRecord;
use crate::weatherlink::{ApiFailure, Endpoint, RawPayload};
use chrono::Utc;
use std::sync::atomic::Ordering;

impl HealthIngestor {
    pub async fn run_cycle(
        &self,
        creds: &CredentialContext,
        window: ArchiveWindow,
    ) -> CycleOutcome {
        self.run_cycle_at(creds, window, Utc::now().timestamp()).await
    }

    pub async fn run_cycle_at(
        &self,
        creds: &CredentialContext,
        window: ArchiveWindow,
        now: i64,
    ) -> CycleOutcome {
        let date_time = window.date_time();
        let station = creds.station_id.as_str();
        self.stats.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.stats.last_cycle_unix.store(date_time, Ordering::Relaxed);
        tracing::debug!(date_time, station, state = ?CycleState::Idle, "archive interval received");

        if let Some(max_lag) = self.max_event_lag {
            let lag_secs = now - window.end;
            if lag_secs > max_lag.as_secs() as i64 {
                self.stats.cycles_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    date_time,
                    station,
                    lag_secs,
                    max_lag_secs = max_lag.as_secs(),
                    "archive event too old; skipping health cycle"
                );
                return CycleOutcome::Skipped {
                    date_time,
                    reason: SkipReason::StaleEvent { lag_secs },
                };
            }
        }

        tracing::debug!(date_time, station, state = ?CycleState::Fetching, "fetching health data");
        let (current, historical) = tokio::join!(
            self.client.fetch(creds, Endpoint::Current, &window),
            self.client.fetch(creds, Endpoint::Historical, &window),
        );

        tracing::debug!(date_time, station, state = ?CycleState::Normalizing, "normalizing health data");
        let record = normalize(
            current.as_ref().ok(),
            historical.as_ref().ok(),
            &window,
            station,
            &self.selection,
        );

        let auth_failure = first_auth_failure(&current, &historical);
        match (current, historical) {
            (Err(current), Err(historical)) => {
                self.finish_without_data(record, current, historical, auth_failure)
                    .await
            }
            (current, historical) => {
                let partial = current.is_err() || historical.is_err();
                self.persist(record, partial, auth_failure).await
            }
        }
    }

    /// Both fetches failed. A row already stored for the slot is left alone; otherwise
    /// an all-null placeholder keeps the timestamp slot present.
    async fn finish_without_data(
        &self,
        record: HealthRecord,
        current: ApiFailure,
        historical: ApiFailure,
        auth_failure: Option<ApiFailure>,
    ) -> CycleOutcome {
        let date_time = record.date_time;
        let prior = match self.store.get(date_time, &record.station_id).await {
            Ok(prior) => prior,
            Err(err) => {
                return self.fail(date_time, CycleState::Persisting, None, err.into());
            }
        };

        if prior.is_some() {
            if let Some(auth) = auth_failure {
                return self.fail(date_time, CycleState::Fetching, None, CycleFailure::Auth(auth));
            }
            self.stats.reset_auth_failures();
            self.stats.cycles_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                date_time,
                station = %record.station_id,
                current = %current,
                historical = %historical,
                "both health fetches failed; keeping the stored row"
            );
            return CycleOutcome::Skipped {
                date_time,
                reason: SkipReason::PriorRowKept,
            };
        }

        tracing::debug!(date_time, state = ?CycleState::Persisting, "persisting placeholder record");
        if let Err(err) = self.store.upsert(&record).await {
            return self.fail(date_time, CycleState::Persisting, None, err.into());
        }
        let failure = match auth_failure {
            Some(auth) => CycleFailure::Auth(auth),
            None => CycleFailure::NoData {
                current,
                historical,
            },
        };
        self.fail(date_time, CycleState::Fetching, Some(record), failure)
    }

    async fn persist(
        &self,
        record: HealthRecord,
        partial: bool,
        auth_failure: Option<ApiFailure>,
    ) -> CycleOutcome {
        let date_time = record.date_time;
        tracing::debug!(date_time, state = ?CycleState::Persisting, "persisting health record");
        let ack = match self.store.upsert(&record).await {
            Ok(ack) => ack,
            Err(err) => return self.fail(date_time, CycleState::Persisting, None, err.into()),
        };
        self.stats.last_record_unix.store(date_time, Ordering::Relaxed);

        if let Some(auth) = auth_failure {
            return self.fail(date_time, CycleState::Fetching, Some(record), CycleFailure::Auth(auth));
        }

        self.stats.reset_auth_failures();
        self.stats.clear_error();
        tracing::info!(
            date_time,
            station = %record.station_id,
            populated = record.populated_count(),
            replaced = ack.replaced,
            partial,
            state = ?CycleState::Done,
            "stored health record"
        );
        CycleOutcome::Done {
            record,
            replaced: ack.replaced,
            partial,
        }
    }

    fn fail(
        &self,
        date_time: i64,
        during: CycleState,
        persisted: Option<HealthRecord>,
        failure: CycleFailure,
    ) -> CycleOutcome {
        self.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.stats.record_error(failure.to_string());

        if matches!(failure, CycleFailure::Auth(_)) {
            let consecutive = self.stats.note_auth_failure();
            tracing::error!(
                date_time,
                kind = failure.kind(),
                consecutive_auth_failures = consecutive,
                state = ?CycleState::Failed,
                error = %failure,
                "health cycle failed; check WeatherLink API key and secret"
            );
        } else {
            self.stats.reset_auth_failures();
            tracing::error!(
                date_time,
                kind = failure.kind(),
                during = ?during,
                persisted = persisted.is_some(),
                state = ?CycleState::Failed,
                error = %failure,
                "health cycle failed"
            );
        }

        CycleOutcome::Failed {
            date_time,
            during,
            persisted,
            failure,
        }
    }
}

fn first_auth_failure(
    current: &Result<RawPayload, ApiFailure>,
    historical: &Result<RawPayload, ApiFailure>,
) -> Option<ApiFailure> {
    [current, historical]
        .into_iter()
        .filter_map(|result| result.as_ref().err())
        .find(|failure| failure.is_auth())
        .cloned()
}
