use crate::store::HealthStore;
use crate::weatherlink::RetryPolicy;
use axum::extract::{RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Canned responses for one vendor endpoint. The last entry repeats once the
/// sequence is exhausted.
#[derive(Clone, Debug)]
pub struct VendorScript {
    responses: Vec<(StatusCode, String)>,
}

impl VendorScript {
    pub fn always(status: StatusCode, body: &str) -> Self {
        Self {
            responses: vec![(status, body.to_string())],
        }
    }

    pub fn sequence(responses: Vec<(StatusCode, String)>) -> Self {
        assert!(!responses.is_empty(), "script needs at least one response");
        Self { responses }
    }
}

struct ScriptedEndpoint {
    script: VendorScript,
    hits: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl ScriptedEndpoint {
    fn new(script: VendorScript) -> Self {
        Self {
            script,
            hits: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    fn respond(&self, query: Option<String>) -> (StatusCode, String) {
        let n = self.hits.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.unwrap_or_default());
        let idx = n.min(self.script.responses.len() - 1);
        self.script.responses[idx].clone()
    }
}

struct VendorState {
    current: ScriptedEndpoint,
    historical: ScriptedEndpoint,
}

pub struct MockVendor {
    pub base_url: String,
    state: Arc<VendorState>,
}

impl MockVendor {
    pub fn current_hits(&self) -> usize {
        self.state.current.hits.load(Ordering::SeqCst)
    }

    pub fn historical_hits(&self) -> usize {
        self.state.historical.hits.load(Ordering::SeqCst)
    }

    pub fn current_queries(&self) -> Vec<String> {
        self.state
            .current
            .queries
            .lock()
            .expect("queries lock")
            .clone()
    }

    pub fn historical_queries(&self) -> Vec<String> {
        self.state
            .historical
            .queries
            .lock()
            .expect("queries lock")
            .clone()
    }
}

async fn current_route(
    State(state): State<Arc<VendorState>>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let (status, body) = state.current.respond(query);
    (status, [(CONTENT_TYPE, "application/json")], body)
}

async fn historical_route(
    State(state): State<Arc<VendorState>>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let (status, body) = state.historical.respond(query);
    (status, [(CONTENT_TYPE, "application/json")], body)
}

/// Local stand-in for the WeatherLink v2 API.
pub async fn spawn_vendor(current: VendorScript, historical: VendorScript) -> MockVendor {
    let state = Arc::new(VendorState {
        current: ScriptedEndpoint::new(current),
        historical: ScriptedEndpoint::new(historical),
    });
    let app = Router::new()
        .route("/v2/current/{station_id}", get(current_route))
        .route("/v2/historic/{station_id}", get(historical_route))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock vendor");
    let addr = listener.local_addr().expect("mock vendor addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockVendor {
        base_url: format!("http://{addr}/v2/"),
        state,
    }
}

pub fn fast_policy(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        request_timeout: Duration::from_secs(5),
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub async fn memory_store() -> HealthStore {
    let store = HealthStore::connect("sqlite::memory:", 1)
        .await
        .expect("memory store");
    store.ensure_schema().await.expect("schema");
    store
}

/// Make every insert into the archive fail, leaving reads and deletes working.
pub async fn reject_inserts(store: &HealthStore) {
    sqlx::query(
        "CREATE TRIGGER reject_archive_inserts BEFORE INSERT ON archive BEGIN SELECT RAISE(ABORT, 'health archive is read only'); END",
    )
    .execute(store.pool())
    .await
    .expect("insert trigger");
}

pub fn current_body(battery_voltage: f64, firmware_version: &str) -> String {
    serde_json::json!({
        "station_id": 1,
        "sensors": [
            {
                "lsid": 10,
                "sensor_type": 504,
                "data_structure_type": 15,
                "data": [
                    {
                        "ts": 1_699_999_990,
                        "battery_voltage": battery_voltage,
                        "firmware_version": firmware_version
                    }
                ]
            }
        ],
        "generated_at": 1_700_000_001
    })
    .to_string()
}

pub fn historical_body(reception: i64, rssi: i64, supercap_volt_last: f64) -> String {
    serde_json::json!({
        "station_id": 1,
        "sensors": [
            {
                "lsid": 11,
                "sensor_type": 37,
                "data_structure_type": 11,
                "data": [
                    {
                        "ts": 1_699_999_999,
                        "reception": reception,
                        "rssi": rssi,
                        "supercap_volt_last": supercap_volt_last
                    }
                ]
            }
        ],
        "generated_at": 1_700_000_001
    })
    .to_string()
}
