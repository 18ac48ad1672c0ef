use crate::context::ArchiveWindow;
use crate::record::{BatteryFlag, HealthRecord};
use crate::weatherlink::{RawPayload, SensorBlock};
use serde_json::{Map, Value as JsonValue};

type Sample = Map<String, JsonValue>;

/// Data structure type codes the normalizer reads from each endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorSelection {
    pub current: Vec<u32>,
    pub historical: Vec<u32>,
}

impl Default for SensorSelection {
    fn default() -> Self {
        Self {
            // WeatherLink Live / console health
            current: vec![15],
            // ISS and VP2 ISS health archive
            historical: vec![11, 13],
        }
    }
}

/// Merge whatever payloads arrived into one record for the window.
///
/// Missing payloads, blocks and fields leave the corresponding columns `None`.
pub fn normalize(
    current: Option<&RawPayload>,
    historical: Option<&RawPayload>,
    window: &ArchiveWindow,
    station_id: &str,
    selection: &SensorSelection,
) -> HealthRecord {
    let interval_minutes = (window.interval_secs() / 60).max(1);
    let mut record = HealthRecord::empty(window.date_time(), station_id, interval_minutes);

    if let Some(sample) = historical.and_then(|payload| select_sample(payload, &selection.historical)) {
        apply_historical(&mut record, sample);
    }
    if let Some(sample) = current.and_then(|payload| select_sample(payload, &selection.current)) {
        apply_current(&mut record, sample);
    }

    record
}

/// Configured types are tried in order; within a type the first non-empty block wins.
fn select_sample<'a>(payload: &'a RawPayload, types: &[u32]) -> Option<&'a Sample> {
    let by_type = payload.blocks_by_type();
    let mut candidates = types
        .iter()
        .filter_map(|code| by_type.get(code))
        .flatten()
        .copied()
        .filter(|block| !block.is_empty());

    let block = candidates.next()?;
    let skipped = candidates.count();
    if skipped > 0 {
        tracing::debug!(
            lsid = ?block.lsid,
            sensor_type = ?block.sensor_type,
            data_structure_type = ?block.data_structure_type,
            skipped,
            "multiple health blocks present; using the first"
        );
    }
    latest_sample(block)
}

/// Health metrics are instantaneous state, so a short series collapses to its newest
/// sample rather than an aggregate.
fn latest_sample(block: &SensorBlock) -> Option<&Sample> {
    let mut newest: Option<(i64, &Sample)> = None;
    for sample in &block.data {
        let Some(ts) = sample.get("ts").and_then(as_i64) else {
            continue;
        };
        if newest.map(|(best, _)| ts >= best).unwrap_or(true) {
            newest = Some((ts, sample));
        }
    }
    newest.map(|(_, sample)| sample).or_else(|| block.data.last())
}

fn apply_historical(record: &mut HealthRecord, sample: &Sample) {
    record.signal_quality = int(sample, "reception");
    record.rssi = real(sample, "rssi");
    record.supercap_volt = real(sample, "supercap_volt_last");
    record.solar_volt = real(sample, "solar_volt_last");
    record.packet_streak = int(sample, "good_packets_streak");
    record.tx_id = int(sample, "tx_id");
    record.tx_battery = real(sample, "trans_battery");
    record.rainfall_clicks = int(sample, "rainfall_clicks");
    record.solar_rad_volt = real(sample, "solar_rad_volt_last");
    record.tx_battery_flag = int(sample, "trans_battery_flag").map(BatteryFlag::from_code);
    record.error_packets = int(sample, "error_packets");
    record.afc = real(sample, "afc");
    record.resynchs = int(sample, "resynchs");
    record.uv_volt = real(sample, "uv_volt_last");
}

fn apply_current(record: &mut HealthRecord, sample: &Sample) {
    record.console_battery = real(sample, "battery_voltage");
    record.rapid_records = int(sample, "rapid_records_sent");
    record.firmware_version = text(sample, "firmware_version");
    record.uptime = real(sample, "uptime");
    record.touchpad_wakeups = int(sample, "touchpad_wakeups");
    record.bootloader_version = text(sample, "bootloader_version");
    record.local_api_queries = int(sample, "local_api_queries");
    record.rx_bytes = int(sample, "rx_bytes");
    record.health_version = text(sample, "health_version");
    record.radio_version = text(sample, "radio_version");
    record.espressif_version = text(sample, "espressif_version");
    record.link_uptime = real(sample, "link_uptime");
    record.console_power = real(sample, "input_voltage");
    record.tx_bytes = int(sample, "tx_bytes");
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v.round() as i64)),
        JsonValue::String(raw) => raw.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn int(sample: &Sample, key: &str) -> Option<i64> {
    sample.get(key).and_then(as_i64)
}

fn real(sample: &Sample, key: &str) -> Option<f64> {
    match sample.get(key)? {
        JsonValue::Number(number) => number.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn text(sample: &Sample, key: &str) -> Option<String> {
    match sample.get(key)? {
        JsonValue::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
