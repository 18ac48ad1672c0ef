use crate::context::CredentialContext;
use crate::normalize::SensorSelection;
use crate::weatherlink::{RetryPolicy, DEFAULT_API_BASE};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://davishealthapi.sdb?mode=rwc";
const DEFAULT_HOOK_BIND: &str = "127.0.0.1:8787";
const DEFAULT_MAX_AGE_SECS: u64 = 2_592_000;

fn setup_config_path() -> Option<PathBuf> {
    env::var("HEALTH_SETUP_CONFIG_PATH")
        .ok()
        .map(|path| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SetupConfigOverrides {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    station_id: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    archive_interval_secs: Option<u64>,
    #[serde(default)]
    max_age_secs: Option<u64>,
    #[serde(default)]
    current_sensor_types: Option<Vec<u32>>,
    #[serde(default)]
    historical_sensor_types: Option<Vec<u32>>,
    #[serde(default)]
    trigger_mode: Option<String>,
    #[serde(default)]
    hook_bind: Option<String>,
}

pub(crate) fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "davis-health-sidecar failed to read setup config; using env only"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "davis-health-sidecar failed to parse setup config; using env only"
            );
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    /// Self-scheduled loop on archive boundaries.
    Timer,
    /// Cycles run when the host posts an archive event.
    Hook,
}

impl TriggerMode {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "timer" | "driver" => Ok(TriggerMode::Timer),
            "hook" | "service" => Ok(TriggerMode::Hook),
            other => bail!("unknown trigger mode {other:?}; expected timer or hook"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: String,
    pub api_secret: String,
    pub station_id: String,
    pub api_base_url: String,
    pub database_url: String,
    pub db_pool_size: u32,
    pub archive_interval_secs: u64,
    pub archive_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub current_sensor_types: Vec<u32>,
    pub historical_sensor_types: Vec<u32>,
    /// Retention for stored rows; 0 keeps everything.
    pub max_age_secs: u64,
    /// Archive events older than this are skipped; 0 accepts any age.
    pub max_event_lag_secs: u64,
    pub trigger_mode: TriggerMode,
    pub hook_bind: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = setup_config_path()
            .and_then(|path| load_setup_config_overrides(&path))
            .unwrap_or_default();
        Self::from_sources(|key| env::var(key).ok(), &overrides)
    }

    /// Environment values win over the setup file; both win over defaults.
    pub(crate) fn from_sources(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: &SetupConfigOverrides,
    ) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let text = |key: &str, fallback: &Option<String>| {
            var(key).or_else(|| {
                fallback
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };

        let api_key = text("WEATHERLINK_API_KEY", &overrides.api_key)
            .context("WEATHERLINK_API_KEY is required (or api_key in the setup config)")?;
        let api_secret = text("WEATHERLINK_API_SECRET", &overrides.api_secret)
            .context("WEATHERLINK_API_SECRET is required (or api_secret in the setup config)")?;
        let station_id = text("WEATHERLINK_STATION_ID", &overrides.station_id)
            .context("WEATHERLINK_STATION_ID is required (or station_id in the setup config)")?;

        let api_base_url =
            var("WEATHERLINK_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let database_url = text("HEALTH_DATABASE_URL", &overrides.database_url)
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let db_pool_size = parse_or(var("HEALTH_DB_POOL_SIZE"), 4u32)?;

        let archive_interval_secs = match var("HEALTH_ARCHIVE_INTERVAL_SECS") {
            Some(raw) => parse_value("HEALTH_ARCHIVE_INTERVAL_SECS", &raw)?,
            None => overrides.archive_interval_secs.unwrap_or(300),
        };
        if archive_interval_secs < 60 {
            bail!("HEALTH_ARCHIVE_INTERVAL_SECS must be at least 60, got {archive_interval_secs}");
        }
        let archive_delay_secs = parse_or(var("HEALTH_ARCHIVE_DELAY_SECS"), 15u64)?;

        let request_timeout_secs = parse_or(var("HEALTH_REQUEST_TIMEOUT_SECS"), 10u64)?;
        let max_attempts = parse_or(var("HEALTH_MAX_ATTEMPTS"), 3usize)?.max(1);
        let retry_base_delay_ms = parse_or(var("HEALTH_RETRY_BASE_DELAY_MS"), 2_000u64)?;
        let retry_max_delay_ms = parse_or(var("HEALTH_RETRY_MAX_DELAY_MS"), 30_000u64)?;

        let defaults = SensorSelection::default();
        let current_sensor_types = match var("HEALTH_CURRENT_SENSOR_TYPES") {
            Some(raw) => parse_code_list("HEALTH_CURRENT_SENSOR_TYPES", &raw)?,
            None => overrides
                .current_sensor_types
                .clone()
                .filter(|codes| !codes.is_empty())
                .unwrap_or(defaults.current),
        };
        let historical_sensor_types = match var("HEALTH_HISTORICAL_SENSOR_TYPES") {
            Some(raw) => parse_code_list("HEALTH_HISTORICAL_SENSOR_TYPES", &raw)?,
            None => overrides
                .historical_sensor_types
                .clone()
                .filter(|codes| !codes.is_empty())
                .unwrap_or(defaults.historical),
        };

        let max_age_secs = match var("HEALTH_MAX_AGE_SECS") {
            Some(raw) => parse_value("HEALTH_MAX_AGE_SECS", &raw)?,
            None => overrides.max_age_secs.unwrap_or(DEFAULT_MAX_AGE_SECS),
        };
        let max_event_lag_secs = parse_or(var("HEALTH_MAX_EVENT_LAG_SECS"), archive_interval_secs)?;

        let trigger_mode = match text("HEALTH_TRIGGER_MODE", &overrides.trigger_mode) {
            Some(raw) => TriggerMode::parse(&raw)?,
            None => TriggerMode::Timer,
        };
        let hook_bind = text("HEALTH_HOOK_BIND", &overrides.hook_bind)
            .unwrap_or_else(|| DEFAULT_HOOK_BIND.to_string());
        let otlp_endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            api_key,
            api_secret,
            station_id,
            api_base_url,
            database_url,
            db_pool_size,
            archive_interval_secs,
            archive_delay_secs,
            request_timeout_secs,
            max_attempts,
            retry_base_delay_ms,
            retry_max_delay_ms,
            current_sensor_types,
            historical_sensor_types,
            max_age_secs,
            max_event_lag_secs,
            trigger_mode,
            hook_bind,
            otlp_endpoint,
        })
    }

    /// A fresh credential context; callers build one per cycle.
    pub fn credentials(&self) -> CredentialContext {
        CredentialContext::new(&self.api_key, &self.api_secret, &self.station_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn sensor_selection(&self) -> SensorSelection {
        SensorSelection {
            current: self.current_sensor_types.clone(),
            historical: self.historical_sensor_types.clone(),
        }
    }

    pub fn archive_delay(&self) -> Duration {
        Duration::from_secs(self.archive_delay_secs)
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    pub fn max_event_lag(&self) -> Option<Duration> {
        (self.max_event_lag_secs > 0).then(|| Duration::from_secs(self.max_event_lag_secs))
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse::<T>()
        .with_context(|| format!("{key} has an invalid value {raw:?}"))
}

fn parse_or<T>(raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid numeric setting {raw:?}")),
        None => Ok(default),
    }
}

fn parse_code_list(key: &str, raw: &str) -> Result<Vec<u32>> {
    let codes = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_value::<u32>(key, part))
        .collect::<Result<Vec<_>>>()?;
    if codes.is_empty() {
        bail!("{key} must list at least one data structure type");
    }
    Ok(codes)
}
