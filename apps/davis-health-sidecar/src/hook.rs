use crate::context::ArchiveWindow;
use crate::ingest::{CycleFailure, CycleOutcome, StatsSnapshot};
use crate::record::HealthRecord;
use crate::trigger::{ArchiveHook, ArchiveService};
use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Archive event posted by the host at the end of an interval.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArchiveEvent {
    Window {
        start: i64,
        end: i64,
    },
    /// Host archive record stamp; `interval` is in minutes like the stored row.
    Record {
        #[serde(rename = "dateTime")]
        date_time: i64,
        #[serde(default)]
        interval: Option<i64>,
    },
}

impl ArchiveEvent {
    fn window(&self, default_interval_secs: u64) -> Option<ArchiveWindow> {
        match *self {
            ArchiveEvent::Window { start, end } => ArchiveWindow::new(start, end),
            ArchiveEvent::Record {
                date_time,
                interval,
            } => {
                let secs = match interval {
                    Some(minutes) if minutes > 0 => minutes.checked_mul(60)?,
                    Some(_) => return None,
                    None => i64::try_from(default_interval_secs).ok()?,
                };
                ArchiveWindow::new(date_time.checked_sub(secs)?, date_time)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: i64,
    to: i64,
    #[serde(default)]
    station: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    #[serde(default)]
    max_age: Option<i64>,
    #[serde(default)]
    station: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    station_id: String,
    stats: StatsSnapshot,
}

type HookState = Arc<ArchiveService>;

fn store_error(err: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!(error = %err, "health store query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
}

async fn archive_handler(
    State(service): State<HookState>,
    Json(event): Json<ArchiveEvent>,
) -> Result<(StatusCode, Json<JsonValue>), (StatusCode, String)> {
    let window = event
        .window(service.config().archive_interval_secs)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "Invalid archive window".to_string()))?;

    let outcome = service.on_archive_interval(window).await;
    let status = match &outcome {
        CycleOutcome::Failed {
            failure: CycleFailure::Persist(_),
            ..
        } => StatusCode::INTERNAL_SERVER_ERROR,
        CycleOutcome::Failed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome.to_json())))
}

async fn healthz_handler(State(service): State<HookState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        station_id: service.config().station_id.clone(),
        stats: service.ingestor().stats().snapshot(),
    })
}

async fn records_handler(
    State(service): State<HookState>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<HealthRecord>>, (StatusCode, String)> {
    if params.from > params.to {
        return Err((StatusCode::BAD_REQUEST, "from must not be after to".to_string()));
    }
    let station = params
        .station
        .unwrap_or_else(|| service.config().station_id.clone());
    let records = service
        .ingestor()
        .store()
        .range(&station, params.from, params.to)
        .await
        .map_err(store_error)?;
    Ok(Json(records))
}

async fn latest_handler(
    State(service): State<HookState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<HealthRecord>, (StatusCode, String)> {
    let config = service.config();
    let max_age = params
        .max_age
        .unwrap_or(config.archive_interval_secs as i64 * 2);
    let station = params
        .station
        .unwrap_or_else(|| config.station_id.clone());
    let record = service
        .ingestor()
        .store()
        .latest(&station, Utc::now().timestamp(), max_age)
        .await
        .map_err(store_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No recent health record".to_string()))?;
    Ok(Json(record))
}

pub fn router(service: HookState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/v1/archive", post(archive_handler))
        .route("/v1/records", get(records_handler))
        .route("/v1/records/latest", get(latest_handler))
        .with_state(service)
}

pub async fn serve(bind: &str, service: HookState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind archive hook on {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "archive hook listening");
    axum::serve(listener, router(service))
        .await
        .context("archive hook server exited")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SetupConfigOverrides};
    use crate::ingest::HealthIngestor;
    use crate::normalize::SensorSelection;
    use crate::store::HealthStore;
    use crate::test_support::{
        current_body, fast_policy, historical_body, memory_store, reject_inserts, spawn_vendor,
        VendorScript,
    };
    use crate::weatherlink::WeatherLinkClient;
    use reqwest::Client;
    use serde_json::json;

    fn config() -> Arc<Config> {
        let lookup = |key: &str| match key {
            "WEATHERLINK_API_KEY" => Some("key".to_string()),
            "WEATHERLINK_API_SECRET" => Some("secret".to_string()),
            "WEATHERLINK_STATION_ID" => Some("S1".to_string()),
            "HEALTH_MAX_AGE_SECS" => Some("0".to_string()),
            _ => None,
        };
        Arc::new(Config::from_sources(lookup, &SetupConfigOverrides::default()).expect("config"))
    }

    async fn spawn_hook(current: VendorScript, historical: VendorScript) -> String {
        spawn_hook_on(memory_store().await, current, historical).await
    }

    async fn spawn_hook_on(
        store: HealthStore,
        current: VendorScript,
        historical: VendorScript,
    ) -> String {
        let vendor = spawn_vendor(current, historical).await;
        let client = WeatherLinkClient::new(Client::new(), &vendor.base_url, fast_policy(2))
            .expect("client");
        let ingestor = HealthIngestor::new(client, store, SensorSelection::default());
        let service = Arc::new(ArchiveService::new(ingestor, config()));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind hook");
        let addr = listener.local_addr().expect("hook addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(service)).await;
        });
        format!("http://{addr}")
    }

    fn recent_slot() -> i64 {
        ArchiveWindow::last_closed(Utc::now().timestamp(), 300).end
    }

    #[tokio::test]
    async fn archive_event_runs_a_cycle_and_records_are_queryable() {
        let base = spawn_hook(
            VendorScript::always(axum::http::StatusCode::OK, &current_body(4.6, "1.2")),
            VendorScript::always(axum::http::StatusCode::OK, &historical_body(92, -58, 3.1)),
        )
        .await;
        let http = Client::new();
        let slot = recent_slot();

        let response = http
            .post(format!("{base}/v1/archive"))
            .json(&json!({ "dateTime": slot, "interval": 5 }))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: JsonValue = response.json().await.expect("json");
        assert_eq!(body["status"], "done");
        assert_eq!(body["record"]["consoleBattery"], 4.6);

        let records: Vec<HealthRecord> = http
            .get(format!("{base}/v1/records?from={}&to={}", slot - 300, slot))
            .send()
            .await
            .expect("range")
            .json()
            .await
            .expect("range json");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signal_quality, Some(92));

        let latest = http
            .get(format!("{base}/v1/records/latest?max_age=3600"))
            .send()
            .await
            .expect("latest");
        assert_eq!(latest.status(), reqwest::StatusCode::OK);

        let healthz: JsonValue = http
            .get(format!("{base}/healthz"))
            .send()
            .await
            .expect("healthz")
            .json()
            .await
            .expect("healthz json");
        assert_eq!(healthz["stats"]["cycles_run"], 1);
        assert_eq!(healthz["station_id"], "S1");
    }

    #[tokio::test]
    async fn failed_cycle_reports_bad_gateway() {
        let base = spawn_hook(
            VendorScript::always(axum::http::StatusCode::UNAUTHORIZED, "{}"),
            VendorScript::always(axum::http::StatusCode::UNAUTHORIZED, "{}"),
        )
        .await;
        let slot = recent_slot();

        let response = Client::new()
            .post(format!("{base}/v1/archive"))
            .json(&json!({ "start": slot - 300, "end": slot }))
            .send()
            .await
            .expect("post");

        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: JsonValue = response.json().await.expect("json");
        assert_eq!(body["kind"], "auth");
    }

    #[tokio::test]
    async fn persist_failure_reports_internal_error() {
        let store = memory_store().await;
        reject_inserts(&store).await;
        let base = spawn_hook_on(
            store,
            VendorScript::always(axum::http::StatusCode::OK, &current_body(4.6, "1.2")),
            VendorScript::always(axum::http::StatusCode::OK, &historical_body(92, -58, 3.1)),
        )
        .await;
        let slot = recent_slot();

        let response = Client::new()
            .post(format!("{base}/v1/archive"))
            .json(&json!({ "dateTime": slot, "interval": 5 }))
            .send()
            .await
            .expect("post");

        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let body: JsonValue = response.json().await.expect("json");
        assert_eq!(body["kind"], "persist");
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let base = spawn_hook(
            VendorScript::always(axum::http::StatusCode::OK, "{}"),
            VendorScript::always(axum::http::StatusCode::OK, "{}"),
        )
        .await;
        let http = Client::new();

        let inverted = http
            .post(format!("{base}/v1/archive"))
            .json(&json!({ "start": 2000, "end": 1000 }))
            .send()
            .await
            .expect("post");
        assert_eq!(inverted.status(), reqwest::StatusCode::BAD_REQUEST);

        let range = http
            .get(format!("{base}/v1/records?from=10&to=5"))
            .send()
            .await
            .expect("range");
        assert_eq!(range.status(), reqwest::StatusCode::BAD_REQUEST);

        let latest = http
            .get(format!("{base}/v1/records/latest"))
            .send()
            .await
            .expect("latest");
        assert_eq!(latest.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[test]
    fn record_events_use_minutes() {
        let event: ArchiveEvent =
            serde_json::from_value(json!({ "dateTime": 1_700_000_000, "interval": 5 }))
                .expect("event");
        let window = event.window(600).expect("window");
        assert_eq!(window.start, 1_699_999_700);

        let bare: ArchiveEvent =
            serde_json::from_value(json!({ "dateTime": 1_700_000_000 })).expect("event");
        assert_eq!(bare.window(600).expect("window").start, 1_699_999_400);
    }

    #[test]
    fn out_of_range_record_events_are_refused() {
        let huge: ArchiveEvent =
            serde_json::from_value(json!({ "dateTime": 1_700_000_000, "interval": i64::MAX }))
                .expect("event");
        assert!(huge.window(600).is_none());

        let underflow: ArchiveEvent =
            serde_json::from_value(json!({ "dateTime": i64::MIN, "interval": 5 })).expect("event");
        assert!(underflow.window(600).is_none());

        let span: ArchiveEvent =
            serde_json::from_value(json!({ "start": i64::MIN, "end": i64::MAX })).expect("event");
        assert!(span.window(600).is_none());

        let zero: ArchiveEvent =
            serde_json::from_value(json!({ "dateTime": 1_700_000_000, "interval": 0 }))
                .expect("event");
        assert!(zero.window(600).is_none());
    }

    #[tokio::test]
    async fn overflowing_interval_is_a_bad_request() {
        let base = spawn_hook(
            VendorScript::always(axum::http::StatusCode::OK, "{}"),
            VendorScript::always(axum::http::StatusCode::OK, "{}"),
        )
        .await;

        let response = Client::new()
            .post(format!("{base}/v1/archive"))
            .json(&json!({ "dateTime": 1_700_000_000, "interval": i64::MAX }))
            .send()
            .await
            .expect("post");

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
