//! MQTT client for republishing telemetry
//!
//! Each populated field of a record is published to
//! `<prefix>/<group>/<field>` so live dashboards can subscribe per sensor.
//!
//! Publishing never waits on the broker. Messages are queued for the event
//! loop, and a full queue (broker down) fails the record instead of blocking
//! the other sinks.

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::telemetry::TelemetryRecord;

/// Requests buffered for the event loop. Holds several full records.
const REQUEST_QUEUE_CAPACITY: usize = 256;

/// MQTT client for publishing telemetry
pub struct MqttClient {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
    _event_loop_handle: JoinHandle<()>,
}

impl MqttClient {
    /// Create a new MQTT client and connect to broker
    ///
    /// # Arguments
    /// * `broker_url` - URL like "mqtt://localhost:1883"
    /// * `client_id` - Unique client identifier
    /// * `topic_prefix` - Root of the published topic tree
    /// * `qos` - Quality of Service level (0, 1, or 2)
    pub async fn new(
        broker_url: &str,
        client_id: &str,
        topic_prefix: &str,
        qos: u8,
    ) -> Result<Self> {
        info!(broker = broker_url, client_id = client_id, "Connecting to MQTT broker");

        let (host, port) = parse_broker_url(broker_url)?;
        let qos = qos_level(qos)?;

        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(mqttoptions, REQUEST_QUEUE_CAPACITY);

        // The event loop drives the connection; it must be polled for
        // publishes to go out.
        let event_loop_handle = tokio::spawn(async move {
            info!("MQTT event loop started");
            loop {
                match event_loop.poll().await {
                    Ok(notification) => {
                        debug!("MQTT notification: {:?}", notification);
                    }
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self {
            client,
            topic_prefix: topic_prefix.to_string(),
            qos,
            _event_loop_handle: event_loop_handle,
        })
    }

    /// Queue a message for a topic. Fails at once if the request queue is
    /// full or the event loop is gone.
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, self.qos, retain, payload.as_bytes())
            .with_context(|| format!("Failed to publish to topic: {}", topic))?;

        debug!(topic = topic, payload_len = payload.len(), "Published to MQTT");
        Ok(())
    }

    /// Publish every populated field of a record, retained so late
    /// subscribers see the latest reading.
    pub fn publish_record(&self, record: &TelemetryRecord) -> Result<()> {
        for (group, name, value) in record.numeric_fields() {
            if let Some(value) = value {
                let topic = Self::build_topic(&self.topic_prefix, group, name);
                self.publish(&topic, &value.to_string(), true)?;
            }
        }
        if let Some(nmea) = &record.nmea {
            let topic = Self::build_topic(&self.topic_prefix, "gps", "nmea");
            self.publish(&topic, nmea, true)?;
        }
        if let Some(ts) = record.timestamp {
            let topic = format!("{}/timestamp", self.topic_prefix);
            self.publish(&topic, &ts.to_string(), true)?;
        }
        Ok(())
    }

    /// Build topic name for a sensor reading
    ///
    /// Topic hierarchy:
    /// - cubesat/imu/acelx
    /// - cubesat/gps/lat
    /// - cubesat/bmp/pressure
    /// - cubesat/system/cpu_usage
    pub fn build_topic(prefix: &str, group: &str, metric: &str) -> String {
        format!("{}/{}/{}", prefix, group, metric)
    }
}

fn qos_level(qos: u8) -> Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => anyhow::bail!("Invalid MQTT QoS level: {}", other),
    }
}

/// Parse MQTT broker URL into host and port
///
/// Supports:
/// - mqtt://localhost:1883
/// - mqtt://192.168.1.100:1883
/// - mqtts://broker.example.com:8883
fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let url_without_protocol = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("mqtts://"))
        .context("Invalid MQTT URL: must start with mqtt:// or mqtts://")?;

    if let Some((host, port_str)) = url_without_protocol.split_once(':') {
        let port = port_str
            .parse::<u16>()
            .context("Invalid port number in MQTT URL")?;
        Ok((host.to_string(), port))
    } else {
        Ok((url_without_protocol.to_string(), 1883))
    }
}
