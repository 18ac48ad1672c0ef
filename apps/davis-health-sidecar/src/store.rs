use crate::record::{FieldValue, HealthRecord};
use anyhow::{bail, Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const TABLE_NAME: &str = "archive";
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PersistFailure {
    #[error("health store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("health record rejected by store: {0}")]
    Rejected(#[source] sqlx::Error),
}

impl From<sqlx::Error> for PersistFailure {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(_) => PersistFailure::Rejected(err),
            other => PersistFailure::Unavailable(other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpsertAck {
    pub date_time: i64,
    pub station_id: String,
    pub replaced: bool,
}

/// Dedicated health archive, keyed by `(dateTime, stationId)`.
#[derive(Clone, Debug)]
pub struct HealthStore {
    pool: SqlitePool,
}

impl HealthStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid health database URL {database_url}"))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open health database {database_url}"))?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the archive table, or add any measurement columns an older table lacks.
    /// Existing rows read the new columns as NULL. Returns the columns that were added.
    pub async fn ensure_schema(&self) -> Result<Vec<&'static str>> {
        let mut ddl = format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (\n    dateTime INTEGER NOT NULL,\n    stationId TEXT NOT NULL,\n    usUnits INTEGER NOT NULL,\n    interval INTEGER NOT NULL"
        );
        for (name, column_type) in HealthRecord::measurement_columns() {
            ddl.push_str(&format!(",\n    {name} {}", column_type.sql()));
        }
        ddl.push_str(",\n    PRIMARY KEY (dateTime, stationId)\n)");
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .context("failed to create health archive table")?;

        let existing: HashSet<String> =
            sqlx::query(&format!("PRAGMA table_info({TABLE_NAME})"))
                .fetch_all(&self.pool)
                .await
                .context("failed to inspect health archive table")?
                .iter()
                .map(|row| row.try_get::<String, _>("name"))
                .collect::<Result<_, _>>()?;

        for key in ["dateTime", "stationId", "usUnits", "interval"] {
            if !existing.contains(key) {
                bail!("health archive table is missing key column {key}; it predates multi-station support and must be migrated by hand");
            }
        }

        let mut added = Vec::new();
        for (name, column_type) in HealthRecord::measurement_columns() {
            if existing.contains(name) {
                continue;
            }
            sqlx::query(&format!(
                "ALTER TABLE {TABLE_NAME} ADD COLUMN {name} {}",
                column_type.sql()
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to add column {name} to health archive"))?;
            tracing::info!(column = name, "added health archive column");
            added.push(name);
        }

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {TABLE_NAME}_station_time ON {TABLE_NAME} (stationId, dateTime)"
        ))
        .execute(&self.pool)
        .await
        .context("failed to index health archive")?;

        Ok(added)
    }

    /// Insert the record, or replace the whole row already stored for its slot.
    ///
    /// Runs under `BEGIN IMMEDIATE` so concurrent writers queue on the busy timeout
    /// instead of deadlocking on a shared read lock.
    pub async fn upsert(&self, record: &HealthRecord) -> Result<UpsertAck, PersistFailure> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match write_record(&mut conn, record).await {
            Ok(replaced) => {
                if let Err(err) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    rollback(conn).await;
                    return Err(err.into());
                }
                Ok(UpsertAck {
                    date_time: record.date_time,
                    station_id: record.station_id.clone(),
                    replaced,
                })
            }
            Err(err) => {
                rollback(conn).await;
                Err(err.into())
            }
        }
    }

    pub async fn get(&self, date_time: i64, station_id: &str) -> Result<Option<HealthRecord>, PersistFailure> {
        let record = sqlx::query_as::<_, HealthRecord>(&format!(
            "SELECT * FROM {TABLE_NAME} WHERE dateTime = ? AND stationId = ?"
        ))
        .bind(date_time)
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Records with `dateTime` in `[from, to]`, oldest first.
    pub async fn range(
        &self,
        station_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<HealthRecord>, PersistFailure> {
        let records = sqlx::query_as::<_, HealthRecord>(&format!(
            "SELECT * FROM {TABLE_NAME} WHERE stationId = ? AND dateTime >= ? AND dateTime <= ? ORDER BY dateTime ASC"
        ))
        .bind(station_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Most recent record at or before `now`, if it is no older than `max_staleness_secs`.
    pub async fn latest(
        &self,
        station_id: &str,
        now: i64,
        max_staleness_secs: i64,
    ) -> Result<Option<HealthRecord>, PersistFailure> {
        let record = sqlx::query_as::<_, HealthRecord>(&format!(
            "SELECT * FROM {TABLE_NAME} WHERE stationId = ? AND dateTime <= ? AND dateTime >= ? ORDER BY dateTime DESC LIMIT 1"
        ))
        .bind(station_id)
        .bind(now)
        .bind(now.saturating_sub(max_staleness_secs.max(0)))
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn count(&self, station_id: &str) -> Result<i64, PersistFailure> {
        let count = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {TABLE_NAME} WHERE stationId = ?"
        ))
        .bind(station_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete rows older than `cutoff` across all stations.
    pub async fn prune_before(&self, cutoff: i64) -> Result<u64, PersistFailure> {
        let deleted = sqlx::query(&format!("DELETE FROM {TABLE_NAME} WHERE dateTime < ?"))
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if deleted > 0 {
            // sqlite does not give pages back on its own
            if let Err(err) = sqlx::query("VACUUM").execute(&self.pool).await {
                tracing::warn!(error = %err, "health archive vacuum failed");
            }
        }
        Ok(deleted)
    }
}

/// Returns whether a row already occupied the slot.
async fn write_record(conn: &mut SqliteConnection, record: &HealthRecord) -> Result<bool, sqlx::Error> {
    let measurements = record.measurements();

    let existing: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {TABLE_NAME} WHERE dateTime = ? AND stationId = ?"
    ))
    .bind(record.date_time)
    .bind(&record.station_id)
    .fetch_one(&mut *conn)
    .await?;

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "INSERT INTO {TABLE_NAME} (dateTime, stationId, usUnits, interval"
    ));
    for (name, _) in &measurements {
        builder.push(", ").push(*name);
    }
    builder.push(") VALUES (");
    {
        let mut values = builder.separated(", ");
        values
            .push_bind(record.date_time)
            .push_bind(record.station_id.clone())
            .push_bind(record.us_units)
            .push_bind(record.interval);
        for (_, value) in &measurements {
            match value.clone() {
                FieldValue::Integer(v) => values.push_bind(v),
                FieldValue::Real(v) => values.push_bind(v),
                FieldValue::Text(v) => values.push_bind(v),
            };
        }
    }
    builder.push(") ON CONFLICT (dateTime, stationId) DO UPDATE SET usUnits = excluded.usUnits, interval = excluded.interval");
    for (name, _) in &measurements {
        builder.push(format!(", {name} = excluded.{name}"));
    }

    builder.build().execute(&mut *conn).await?;
    Ok(existing > 0)
}

// A connection left inside a transaction must not go back to the pool.
async fn rollback(mut conn: PoolConnection<Sqlite>) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(error = %err, "health archive rollback failed; discarding connection");
        drop(conn.detach());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BatteryFlag;
    use crate::test_support::memory_store;

    fn sample(date_time: i64, station: &str) -> HealthRecord {
        let mut record = HealthRecord::empty(date_time, station, 5);
        record.signal_quality = Some(92);
        record.rssi = Some(-58.0);
        record.tx_battery_flag = Some(BatteryFlag::Ok);
        record.firmware_version = Some("1.2".to_string());
        record
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = memory_store().await;
        let record = sample(1_700_000_000, "S1");

        let first = store.upsert(&record).await.expect("first upsert");
        let second = store.upsert(&record).await.expect("second upsert");

        assert!(!first.replaced);
        assert!(second.replaced);
        assert_eq!(store.count("S1").await.expect("count"), 1);
        assert_eq!(
            store.get(1_700_000_000, "S1").await.expect("get"),
            Some(record)
        );
    }

    #[tokio::test]
    async fn second_ingest_replaces_whole_row() {
        let store = memory_store().await;
        let first = sample(1_700_000_000, "S1");
        store.upsert(&first).await.expect("first upsert");

        let mut corrected = HealthRecord::empty(1_700_000_000, "S1", 5);
        corrected.signal_quality = Some(40);
        corrected.console_battery = Some(4.1);
        store.upsert(&corrected).await.expect("second upsert");

        assert_eq!(store.count("S1").await.expect("count"), 1);
        let stored = store
            .get(1_700_000_000, "S1")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(stored, corrected);
        assert_eq!(stored.rssi, None);
        assert_eq!(stored.firmware_version, None);
    }

    #[tokio::test]
    async fn stations_share_a_slot_without_colliding() {
        let store = memory_store().await;
        store.upsert(&sample(1_700_000_000, "S1")).await.expect("S1");
        store.upsert(&sample(1_700_000_000, "S2")).await.expect("S2");

        assert_eq!(store.count("S1").await.expect("count"), 1);
        assert_eq!(store.count("S2").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_on_a_file_store_all_land() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("health.sdb").display());
        let store = HealthStore::connect(&url, 4).await.expect("connect");
        store.ensure_schema().await.expect("schema");

        let writes = (0..40).map(|n| {
            let store = store.clone();
            let record = sample(1_700_000_000 + (n % 4) * 300, "S1");
            async move { store.upsert(&record).await }
        });
        let results = futures::future::join_all(writes).await;

        for result in &results {
            assert!(result.is_ok(), "upsert failed: {result:?}");
        }
        assert_eq!(store.count("S1").await.expect("count"), 4);
        let fresh = results
            .iter()
            .filter(|result| matches!(result, Ok(ack) if !ack.replaced))
            .count();
        assert_eq!(fresh, 4);
    }

    #[tokio::test]
    async fn range_and_latest_queries() {
        let store = memory_store().await;
        for offset in 0..4 {
            store
                .upsert(&sample(1_700_000_000 + offset * 300, "S1"))
                .await
                .expect("upsert");
        }

        let rows = store
            .range("S1", 1_700_000_300, 1_700_000_600)
            .await
            .expect("range");
        let stamps: Vec<i64> = rows.iter().map(|row| row.date_time).collect();
        assert_eq!(stamps, vec![1_700_000_300, 1_700_000_600]);

        let latest = store
            .latest("S1", 1_700_000_950, 600)
            .await
            .expect("latest")
            .expect("row");
        assert_eq!(latest.date_time, 1_700_000_900);

        let stale = store
            .latest("S1", 1_700_010_000, 600)
            .await
            .expect("latest");
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let store = memory_store().await;
        store.upsert(&sample(1_000, "S1")).await.expect("old");
        store.upsert(&sample(2_000, "S1")).await.expect("new");

        let deleted = store.prune_before(1_500).await.expect("prune");

        assert_eq!(deleted, 1);
        assert_eq!(store.count("S1").await.expect("count"), 1);
        assert!(store.get(2_000, "S1").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn older_tables_gain_new_columns_as_null() {
        let store = HealthStore::connect("sqlite::memory:", 1)
            .await
            .expect("connect");
        sqlx::query(
            "CREATE TABLE archive (dateTime INTEGER NOT NULL, stationId TEXT NOT NULL, usUnits INTEGER NOT NULL, interval INTEGER NOT NULL, signalQuality INTEGER, rssi REAL, PRIMARY KEY (dateTime, stationId))",
        )
        .execute(store.pool())
        .await
        .expect("legacy table");
        sqlx::query("INSERT INTO archive (dateTime, stationId, usUnits, interval, signalQuality, rssi) VALUES (1000, 'S1', 1, 5, 77, -61.0)")
            .execute(store.pool())
            .await
            .expect("legacy row");

        let added = store.ensure_schema().await.expect("schema");
        assert!(added.contains(&"consoleBattery"));
        assert!(!added.contains(&"rssi"));

        let legacy = store.get(1000, "S1").await.expect("get").expect("row");
        assert_eq!(legacy.signal_quality, Some(77));
        assert_eq!(legacy.rssi, Some(-61.0));
        assert_eq!(legacy.console_battery, None);
        assert_eq!(legacy.tx_battery_flag, None);

        assert!(store.ensure_schema().await.expect("rerun").is_empty());
        store.upsert(&sample(2000, "S1")).await.expect("upsert");
        assert_eq!(store.count("S1").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn tables_without_station_key_are_refused() {
        let store = HealthStore::connect("sqlite::memory:", 1)
            .await
            .expect("connect");
        sqlx::query("CREATE TABLE archive (dateTime INTEGER NOT NULL PRIMARY KEY, usUnits INTEGER NOT NULL, interval INTEGER NOT NULL)")
            .execute(store.pool())
            .await
            .expect("legacy table");

        assert!(store.ensure_schema().await.is_err());
    }
}
