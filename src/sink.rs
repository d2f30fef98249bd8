//! Storage sinks for flattened telemetry.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::SinkError;
use crate::influxdb::InfluxDbClient;
use crate::mqtt::MqttClient;
use crate::postgres::PostgresSink;
use crate::telemetry::TelemetryRecord;

/// Destination that persists one record at a time.
pub trait TelemetrySink {
    fn name(&self) -> &'static str;

    fn persist(
        &self,
        record: &TelemetryRecord,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Upper bound on one backend write. A backend that stalls fails the record
/// for itself only.
pub const PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// One configured backend.
pub enum Sink {
    Postgres(PostgresSink),
    InfluxDb(InfluxDbClient),
    Mqtt(MqttClient),
}

impl TelemetrySink for Sink {
    fn name(&self) -> &'static str {
        match self {
            Sink::Postgres(_) => "postgres",
            Sink::InfluxDb(_) => "influxdb",
            Sink::Mqtt(_) => "mqtt",
        }
    }

    async fn persist(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        match tokio::time::timeout(PERSIST_TIMEOUT, self.write(record)).await {
            Ok(result) => result.map_err(|e| SinkError::persist(self.name(), format!("{:#}", e))),
            Err(_) => Err(SinkError::persist(
                self.name(),
                format!("timed out after {:?}", PERSIST_TIMEOUT),
            )),
        }
    }
}

impl Sink {
    async fn write(&self, record: &TelemetryRecord) -> anyhow::Result<()> {
        match self {
            Sink::Postgres(sink) => sink.insert(record).await.map(|_| ()),
            Sink::InfluxDb(client) => client.write_record(record).await,
            Sink::Mqtt(client) => client.publish_record(record),
        }
    }
}

/// Fans each record out to every configured backend. A failing backend does
/// not keep the record from the others.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Sink>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Sink) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for SinkSet {
    fn name(&self) -> &'static str {
        "all"
    }

    async fn persist(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        let mut failed = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.persist(record).await {
                warn!(sink = sink.name(), error = %e, "Sink failed");
                failed.push(sink.name());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(SinkError::Persist {
                backend: "all",
                reason: format!(
                    "{} of {} sinks failed: {}",
                    failed.len(),
                    self.sinks.len(),
                    failed.join(", ")
                ),
            })
        }
    }
}

/// Sink that keeps records in memory, for tests.
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemorySink {
    pub records: std::sync::Arc<std::sync::Mutex<Vec<TelemetryRecord>>>,
    /// Reject records whose `acelx` equals this value.
    pub reject_acelx: Option<f64>,
}

#[cfg(test)]
impl TelemetrySink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn persist(&self, record: &TelemetryRecord) -> Result<(), SinkError> {
        if self.reject_acelx.is_some() && record.acelx == self.reject_acelx {
            return Err(SinkError::persist("memory", "rejected"));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
