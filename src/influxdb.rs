//! InfluxDB sink for time-series dashboards
//!
//! Writes each telemetry record as one `telemetry` data point whose fields are
//! the populated columns, named `<group>_<field>`.

use anyhow::{Context, Result};
use influxdb2::models::DataPoint;
use influxdb2::Client;
use tracing::{debug, info};

use crate::telemetry::TelemetryRecord;

/// Measurement name for telemetry points
pub const MEASUREMENT: &str = "telemetry";

/// InfluxDB client for writing telemetry
pub struct InfluxDbClient {
    client: Client,
    bucket: String,
    url: String,
}

impl InfluxDbClient {
    /// Create a new InfluxDB client
    ///
    /// # Arguments
    /// * `url` - InfluxDB server URL (e.g., "http://localhost:8086")
    /// * `org` - Organization name
    /// * `bucket` - Bucket name for data storage
    /// * `token` - Authentication token
    pub fn new(url: &str, org: &str, bucket: &str, token: &str) -> Result<Self> {
        info!(url = url, org = org, bucket = bucket, "Creating InfluxDB client");

        let client = Client::new(url, org, token);

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            url: url.to_string(),
        })
    }

    /// Test connection to InfluxDB with health check
    pub async fn health_check(&self) -> Result<()> {
        // The influxdb2 crate doesn't expose /health, query it directly
        let health_url = format!("{}/health", self.url);

        let response = reqwest::get(&health_url)
            .await
            .context("Failed to connect to InfluxDB health endpoint")?;

        let status = response.status();
        if status.is_success() {
            info!(status = %status, "InfluxDB health check passed");
            Ok(())
        } else {
            anyhow::bail!("InfluxDB health check failed with status: {}", status)
        }
    }

    /// Write one telemetry record as a single data point
    ///
    /// Records with no populated fields are skipped.
    pub async fn write_record(&self, record: &TelemetryRecord) -> Result<()> {
        let Some(point) = record_point(record)? else {
            debug!("Skipping InfluxDB write for empty record");
            return Ok(());
        };

        self.client
            .write(&self.bucket, futures::stream::iter(vec![point]))
            .await
            .context("Failed to write data point to InfluxDB")?;

        debug!(fields = record.populated(), "Wrote telemetry to InfluxDB");
        Ok(())
    }
}

/// Build the data point for a record, or `None` if it has no fields.
fn record_point(record: &TelemetryRecord) -> Result<Option<DataPoint>> {
    let mut point = DataPoint::builder(MEASUREMENT).tag("source", "e220");
    let mut fields = 0;

    for (group, name, value) in record.numeric_fields() {
        if let Some(value) = value {
            point = point.field(field_name(group, name), value);
            fields += 1;
        }
    }
    if let Some(nmea) = &record.nmea {
        point = point.field("gps_nmea", nmea.clone());
        fields += 1;
    }

    if fields == 0 {
        return Ok(None);
    }

    if let Some(ts) = record
        .timestamp
        .and_then(|ts| ts.and_utc().timestamp_nanos_opt())
    {
        point = point.timestamp(ts);
    }

    Ok(Some(point.build()?))
}

/// Field key for a column, avoiding a doubled group prefix
/// (`bmp_pressure`, `gps_error`, `bmp_altitude`).
fn field_name(group: &str, name: &str) -> String {
    if name.starts_with(group) {
        name.to_string()
    } else {
        format!("{}_{}", group, name)
    }
}
