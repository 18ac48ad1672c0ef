use crate::config::Config;
use crate::context::ArchiveWindow;
use crate::ingest::{CycleFailure, CycleOutcome, HealthIngestor};
use chrono::Utc;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

/// Anything that reacts to the end of an archive interval.
pub trait ArchiveHook: Send + Sync {
    fn on_archive_interval(&self, window: ArchiveWindow) -> BoxFuture<'_, CycleOutcome>;
}

/// Production hook: one ingest cycle per interval, followed by retention pruning.
#[derive(Clone)]
pub struct ArchiveService {
    ingestor: HealthIngestor,
    config: Arc<Config>,
}

impl ArchiveService {
    pub fn new(ingestor: HealthIngestor, config: Arc<Config>) -> Self {
        Self { ingestor, config }
    }

    pub fn ingestor(&self) -> &HealthIngestor {
        &self.ingestor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn prune(&self) {
        let Some(max_age) = self.config.max_age() else {
            return;
        };
        let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
        match self.ingestor.store().prune_before(cutoff).await {
            Ok(0) => {}
            Ok(deleted) => tracing::info!(deleted, cutoff, "pruned old health records"),
            Err(err) => tracing::warn!(error = %err, cutoff, "health record pruning failed"),
        }
    }
}

impl ArchiveHook for ArchiveService {
    fn on_archive_interval(&self, window: ArchiveWindow) -> BoxFuture<'_, CycleOutcome> {
        Box::pin(async move {
            let creds = self.config.credentials();
            let outcome = self.ingestor.run_cycle(&creds, window).await;
            drop(creds);

            if !matches!(outcome.failure(), Some(CycleFailure::Persist(_))) {
                self.prune().await;
            }
            outcome
        })
    }
}

/// Window to ingest next and the unix time at which to fire it. A window whose close
/// plus `delay_secs` is still ahead of `now` is picked before waiting for the next one.
pub fn next_fire(now: i64, interval_secs: u64, delay_secs: u64) -> (ArchiveWindow, i64) {
    let interval = interval_secs.max(1) as i64;
    let delay = delay_secs as i64;
    let boundary = now.div_euclid(interval) * interval;
    let end = if now < boundary + delay {
        boundary
    } else {
        boundary + interval
    };
    (ArchiveWindow::ending_at(end, interval_secs), end + delay)
}

/// Self-scheduled trigger: sleeps to each archive boundary plus `delay`, then fires.
pub async fn run_timer<H: ArchiveHook + ?Sized>(hook: Arc<H>, interval_secs: u64, delay: Duration) {
    tracing::info!(
        interval_secs,
        delay_secs = delay.as_secs(),
        "archive timer started"
    );
    loop {
        let now_ms = Utc::now().timestamp_millis();
        let (window, fire_at) = next_fire(now_ms.div_euclid(1000), interval_secs, delay.as_secs());
        let wait_ms = (fire_at * 1000 - now_ms).max(0) as u64;
        tracing::debug!(date_time = window.date_time(), wait_ms, "waiting for archive boundary");
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        let outcome = hook.on_archive_interval(window).await;
        tracing::debug!(date_time = outcome.date_time(), failed = outcome.is_failed(), "timer cycle finished");
    }
}
