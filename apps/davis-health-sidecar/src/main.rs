mod config;
mod context;
mod hook;
mod ingest;
mod normalize;
mod record;
mod store;
#[cfg(test)]
mod test_support;
mod trigger;
mod weatherlink;

use crate::config::{Config, TriggerMode};
use crate::ingest::HealthIngestor;
use crate::store::HealthStore;
use crate::trigger::{run_timer, ArchiveService};
use crate::weatherlink::WeatherLinkClient;
use anyhow::{Context, Result};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,davis_health_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "davis-health-sidecar"),
                KeyValue::new("weatherlink.station_id", config.station_id.clone()),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    init_tracing(&config)?;

    let store = HealthStore::connect(&config.database_url, config.db_pool_size).await?;
    let added = store.ensure_schema().await?;
    if !added.is_empty() {
        tracing::info!(columns = ?added, "health archive schema extended");
    }

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let policy = config.retry_policy();
    let client = WeatherLinkClient::new(http, &config.api_base_url, policy.clone())?;
    let ingestor = HealthIngestor::new(client, store, config.sensor_selection())
        .with_max_event_lag(config.max_event_lag());
    let service = Arc::new(ArchiveService::new(ingestor, config.clone()));

    if policy.worst_case().as_secs() >= config.archive_interval_secs {
        tracing::warn!(
            worst_case_secs = policy.worst_case().as_secs(),
            archive_interval_secs = config.archive_interval_secs,
            "retry budget can outlast the archive interval; cycles may overlap"
        );
    }
    tracing::info!(
        station_id = %config.station_id,
        mode = ?config.trigger_mode,
        interval_secs = config.archive_interval_secs,
        database_url = %config.database_url,
        "davis-health-sidecar starting"
    );

    let trigger_handle = match config.trigger_mode {
        TriggerMode::Timer => {
            let interval_secs = config.archive_interval_secs;
            let delay = config.archive_delay();
            tokio::spawn(async move {
                run_timer(service, interval_secs, delay).await;
                Ok::<(), anyhow::Error>(())
            })
        }
        TriggerMode::Hook => {
            let bind = config.hook_bind.clone();
            tokio::spawn(async move { hook::serve(&bind, service).await })
        }
    };

    tokio::select! {
        res = trigger_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("trigger task exited"),
                Ok(Err(err)) => tracing::error!(error=%err, "trigger task failed"),
                Err(err) => tracing::error!(error=%err, "trigger task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
