mod cycle;
mod stats;
mod types;


pub use stats::{IngestStats, StatsSnapshot};
pub use types::{CycleFailure, CycleOutcome};
#[cfg(test)]
pub use types::{CycleState, SkipReason};

use crate::normalize::SensorSelection;
use crate::store::HealthStore;
use crate::weatherlink::WeatherLinkClient;
use std::sync::Arc;
use std::time::Duration;

/// Runs one fetch → normalize → persist cycle per archive interval.
#[derive(Clone)]
pub struct HealthIngestor {
    client: WeatherLinkClient,
    store: HealthStore,
    selection: SensorSelection,
    stats: Arc<IngestStats>,
    max_event_lag: Option<Duration>,
}

impl HealthIngestor {
    pub fn new(client: WeatherLinkClient, store: HealthStore, selection: SensorSelection) -> Self {
        Self {
            client,
            store,
            selection,
            stats: Arc::new(IngestStats::new()),
            max_event_lag: None,
        }
    }

    /// Skip archive events whose window closed more than `lag` ago.
    pub fn with_max_event_lag(mut self, lag: Option<Duration>) -> Self {
        self.max_event_lag = lag;
        self
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn store(&self) -> &HealthStore {
        &self.store
    }
}
