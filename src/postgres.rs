//! PostgreSQL sink
//!
//! Stores one row per packet in the fixed `sensor_data` schema that the
//! ground-station dashboards read from.
//!
//! The database may be down at startup or restart mid-mission. The sink then
//! keeps no connection and opens a fresh one on the next insert, so rows are
//! only lost while the server is actually unreachable.

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, error, info, warn};

use crate::telemetry::TelemetryRecord;

/// Columns in insert order. Everything is `FLOAT` except `nmea` (`TEXT`) and
/// `timestamp` (`TIMESTAMP`).
pub const COLUMNS: [&str; 36] = [
    "acelx",
    "acely",
    "acelz",
    "girox",
    "giroy",
    "giroz",
    "magx",
    "magy",
    "magz",
    "uva",
    "uvb",
    "uvc",
    "uv_temp",
    "cpu_usage",
    "ram_usage",
    "total_ram",
    "disk_usage",
    "disk_usage_gb",
    "total_disk_gb",
    "temperature",
    "lat",
    "lon",
    "alt",
    "headmot",
    "roll",
    "pitch",
    "heading",
    "nmea",
    "lat_hp",
    "lon_hp",
    "alt_hp",
    "gps_error",
    "pressure",
    "bmp_temperature",
    "bmp_altitude",
    "timestamp",
];

/// One live connection with its prepared insert.
struct Session {
    client: Client,
    insert: Statement,
    _connection_handle: JoinHandle<()>,
}

impl Session {
    /// Connect, optionally create the table, and prepare the insert.
    async fn open(url: &str, table: &str, create_table: bool) -> Result<Self> {
        info!(table = table, "Connecting to PostgreSQL");

        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .context("Failed to connect to PostgreSQL")?;

        let connection_handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });

        if create_table {
            client
                .batch_execute(&create_table_sql(table))
                .await
                .with_context(|| format!("Failed to create table {}", table))?;
            info!(table = table, "Ensured telemetry table exists");
        }

        let insert = client
            .prepare(&insert_sql(table))
            .await
            .with_context(|| format!("Failed to prepare insert into {}", table))?;

        info!("PostgreSQL sink ready");

        Ok(Self {
            client,
            insert,
            _connection_handle: connection_handle,
        })
    }
}

pub struct PostgresSink {
    url: String,
    table: String,
    create_table: bool,
    session: Mutex<Option<Session>>,
}

impl PostgresSink {
    /// Validate the table name and try to connect once. An unreachable server
    /// is not an error here; the next insert retries.
    pub async fn open(url: &str, table: &str, create_table: bool) -> Result<Self> {
        check_table_name(table)?;

        let sink = Self {
            url: url.to_string(),
            table: table.to_string(),
            create_table,
            session: Mutex::new(None),
        };

        {
            let mut session = sink.session.lock().await;
            if let Err(e) = sink.ensure_session(&mut session).await {
                warn!(
                    error = %format!("{:#}", e),
                    "PostgreSQL unavailable at startup, will retry on next insert"
                );
            }
        }

        Ok(sink)
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        !needs_reconnect(self.session.lock().await.as_ref().map(|s| s.client.is_closed()))
    }

    /// Reopen the session if there is none or its connection has closed.
    async fn ensure_session<'a>(&self, slot: &'a mut Option<Session>) -> Result<&'a Session> {
        if needs_reconnect(slot.as_ref().map(|s| s.client.is_closed())) {
            if slot.take().is_some() {
                warn!("PostgreSQL connection lost, reconnecting");
            }
            *slot = Some(Session::open(&self.url, &self.table, self.create_table).await?);
        }
        slot.as_ref().context("PostgreSQL session missing")
    }

    /// Insert one row.
    pub async fn insert(&self, record: &TelemetryRecord) -> Result<u64> {
        let params: [&(dyn ToSql + Sync); 36] = [
            &record.acelx,
            &record.acely,
            &record.acelz,
            &record.girox,
            &record.giroy,
            &record.giroz,
            &record.magx,
            &record.magy,
            &record.magz,
            &record.uva,
            &record.uvb,
            &record.uvc,
            &record.uv_temp,
            &record.cpu_usage,
            &record.ram_usage,
            &record.total_ram,
            &record.disk_usage,
            &record.disk_usage_gb,
            &record.total_disk_gb,
            &record.temperature,
            &record.lat,
            &record.lon,
            &record.alt,
            &record.headmot,
            &record.roll,
            &record.pitch,
            &record.heading,
            &record.nmea,
            &record.lat_hp,
            &record.lon_hp,
            &record.alt_hp,
            &record.gps_error,
            &record.pressure,
            &record.bmp_temperature,
            &record.bmp_altitude,
            &record.timestamp,
        ];

        let mut slot = self.session.lock().await;
        let session = self.ensure_session(&mut slot).await?;
        let rows = session
            .client
            .execute(&session.insert, &params)
            .await
            .context("Failed to insert telemetry row")?;

        debug!(rows = rows, "Inserted telemetry row");
        Ok(rows)
    }
}

/// A session is reopened when there is none (`None`) or its client reports
/// the connection closed.
fn needs_reconnect(closed: Option<bool>) -> bool {
    closed.unwrap_or(true)
}

/// Reject anything but `[schema.]table` made of identifier characters, since
/// the name is spliced into SQL.
fn check_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let valid = parts.len() <= 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if !valid {
        anyhow::bail!("Invalid table name: {:?}", table);
    }
    Ok(())
}

fn insert_sql(table: &str) -> String {
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

fn create_table_sql(table: &str) -> String {
    let columns: Vec<String> = COLUMNS
        .iter()
        .map(|column| {
            let ty = match *column {
                "nmea" => "TEXT",
                "timestamp" => "TIMESTAMP",
                _ => "FLOAT",
            };
            format!("    {} {}", column, ty)
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        table,
        columns.join(",\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_check() {
        assert!(check_table_name("sensor_readings").is_ok());
        assert!(check_table_name("grafana_schema.sensor_data").is_ok());

        assert!(check_table_name("").is_err());
        assert!(check_table_name("a.b.c").is_err());
        assert!(check_table_name("1table").is_err());
        assert!(check_table_name("data; DROP TABLE users").is_err());
        assert!(check_table_name("schema.").is_err());
    }

    #[test]
    fn test_needs_reconnect() {
        assert!(needs_reconnect(None));
        assert!(needs_reconnect(Some(true)));
        assert!(!needs_reconnect(Some(false)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retried_per_insert() {
        // Nothing listens on port 1, so every connect is refused.
        let url = "postgresql://relay@127.0.0.1:1/telemetry?connect_timeout=2";
        let sink = PostgresSink::open(url, "sensor_data", false).await.unwrap();
        assert!(!sink.is_connected().await);

        let record = TelemetryRecord::default();
        for _ in 0..2 {
            let err = sink.insert(&record).await.unwrap_err();
            assert!(format!("{:#}", err).contains("Failed to connect to PostgreSQL"));
        }
        assert!(!sink.is_connected().await);
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_fatal() {
        let url = "postgresql://relay@127.0.0.1:1/telemetry?connect_timeout=2";
        assert!(PostgresSink::open(url, "bad;name", false).await.is_err());
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql("sensor_data");
        assert!(sql.starts_with("INSERT INTO sensor_data (acelx, acely, "));
        assert!(sql.contains("bmp_altitude, timestamp)"));
        assert!(sql.ends_with("$35, $36)"));
    }

    #[test]
    fn test_create_table_sql() {
        let sql = create_table_sql("grafana_schema.sensor_data");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS grafana_schema.sensor_data ("));
        assert!(sql.contains("    acelx FLOAT,"));
        assert!(sql.contains("    nmea TEXT,"));
        assert!(sql.contains("    timestamp TIMESTAMP\n)"));
    }
}
