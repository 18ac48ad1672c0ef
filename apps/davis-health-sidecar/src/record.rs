use serde::{Deserialize, Serialize};

/// `usUnits` value for US customary units, the only system this record is written in.
pub const US_UNITS: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum BatteryFlag {
    Ok,
    Low,
}

impl BatteryFlag {
    /// Vendor `trans_battery_flag`: 0 is a healthy transmitter battery, anything else is low.
    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            BatteryFlag::Ok
        } else {
            BatteryFlag::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryFlag::Ok => "OK",
            BatteryFlag::Low => "LOW",
        }
    }
}

/// One archive row of station health.
///
/// Identity is `(date_time, station_id)`. Every measurement is optional: `None` means
/// no sensor reported it, which is different from a zero reading.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
#[sqlx(rename_all = "camelCase")]
pub struct HealthRecord {
    pub date_time: i64,
    pub station_id: String,
    pub us_units: i64,
    /// Archive interval in minutes.
    pub interval: i64,

    // transmitter (historic endpoint)
    pub signal_quality: Option<i64>,
    pub rssi: Option<f64>,
    pub supercap_volt: Option<f64>,
    pub solar_volt: Option<f64>,
    pub tx_battery: Option<f64>,
    pub tx_battery_flag: Option<BatteryFlag>,
    pub packet_streak: Option<i64>,
    pub error_packets: Option<i64>,
    pub resynchs: Option<i64>,
    pub afc: Option<f64>,
    #[serde(rename = "txID")]
    #[sqlx(rename = "txID")]
    pub tx_id: Option<i64>,
    pub rainfall_clicks: Option<i64>,
    pub solar_rad_volt: Option<f64>,
    pub uv_volt: Option<f64>,

    // console (current endpoint)
    pub console_battery: Option<f64>,
    pub console_power: Option<f64>,
    pub rx_bytes: Option<i64>,
    pub tx_bytes: Option<i64>,
    pub uptime: Option<f64>,
    pub link_uptime: Option<f64>,
    pub firmware_version: Option<String>,
    pub bootloader_version: Option<String>,
    pub health_version: Option<String>,
    pub radio_version: Option<String>,
    #[serde(rename = "espressIFVersion")]
    #[sqlx(rename = "espressIFVersion")]
    pub espressif_version: Option<String>,
    pub rapid_records: Option<i64>,
    pub touchpad_wakeups: Option<i64>,
    #[serde(rename = "localAPIQueries")]
    #[sqlx(rename = "localAPIQueries")]
    pub local_api_queries: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Integer(Option<i64>),
    Real(Option<f64>),
    Text(Option<String>),
}

impl FieldValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Integer(_) => ColumnType::Integer,
            FieldValue::Real(_) => ColumnType::Real,
            FieldValue::Text(_) => ColumnType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            FieldValue::Integer(value) => value.is_none(),
            FieldValue::Real(value) => value.is_none(),
            FieldValue::Text(value) => value.is_none(),
        }
    }
}

impl HealthRecord {
    /// An all-null record for the archive slot.
    pub fn empty(date_time: i64, station_id: impl Into<String>, interval_minutes: i64) -> Self {
        Self {
            date_time,
            station_id: station_id.into(),
            us_units: US_UNITS,
            interval: interval_minutes.max(1),
            ..Self::default()
        }
    }

    /// Optional measurement columns in storage order. Adding a field here is all the
    /// store needs to grow the schema.
    pub fn measurements(&self) -> Vec<(&'static str, FieldValue)> {
        use FieldValue::{Integer, Real, Text};
        vec![
            ("signalQuality", Integer(self.signal_quality)),
            ("rssi", Real(self.rssi)),
            ("supercapVolt", Real(self.supercap_volt)),
            ("solarVolt", Real(self.solar_volt)),
            ("txBattery", Real(self.tx_battery)),
            (
                "txBatteryFlag",
                Text(self.tx_battery_flag.map(|flag| flag.as_str().to_string())),
            ),
            ("packetStreak", Integer(self.packet_streak)),
            ("errorPackets", Integer(self.error_packets)),
            ("resynchs", Integer(self.resynchs)),
            ("afc", Real(self.afc)),
            ("txID", Integer(self.tx_id)),
            ("rainfallClicks", Integer(self.rainfall_clicks)),
            ("solarRadVolt", Real(self.solar_rad_volt)),
            ("uvVolt", Real(self.uv_volt)),
            ("consoleBattery", Real(self.console_battery)),
            ("consolePower", Real(self.console_power)),
            ("rxBytes", Integer(self.rx_bytes)),
            ("txBytes", Integer(self.tx_bytes)),
            ("uptime", Real(self.uptime)),
            ("linkUptime", Real(self.link_uptime)),
            ("firmwareVersion", Text(self.firmware_version.clone())),
            ("bootloaderVersion", Text(self.bootloader_version.clone())),
            ("healthVersion", Text(self.health_version.clone())),
            ("radioVersion", Text(self.radio_version.clone())),
            ("espressIFVersion", Text(self.espressif_version.clone())),
            ("rapidRecords", Integer(self.rapid_records)),
            ("touchpadWakeups", Integer(self.touchpad_wakeups)),
            ("localAPIQueries", Integer(self.local_api_queries)),
        ]
    }

    pub fn measurement_columns() -> Vec<(&'static str, ColumnType)> {
        HealthRecord::default()
            .measurements()
            .into_iter()
            .map(|(name, value)| (name, value.column_type()))
            .collect()
    }

    pub fn populated_count(&self) -> usize {
        self.measurements()
            .iter()
            .filter(|(_, value)| !value.is_null())
            .count()
    }
}
