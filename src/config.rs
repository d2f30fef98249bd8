//! Configuration management for the relay
//!
//! Loads configuration from a TOML file with environment variable overrides

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::framing::DEFAULT_MAX_BUFFER;
use crate::radio::ControllerConfig;

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub radio: RadioConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub postgres: PostgresConfig,
    pub influxdb: Option<InfluxDbConfig>,
    pub mqtt: Option<MqttConfig>,
}

/// Radio module wiring and UART settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioConfig {
    /// GPIO character device holding the control lines
    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: String,
    pub m0_line: u32,
    pub m1_line: u32,
    pub aux_line: u32,
    /// Serial device to use; when absent the port is found by USB ids
    pub serial_port: Option<String>,
    /// Accepted USB `(vendor, product)` ids for port discovery
    #[serde(default = "default_usb_ids")]
    pub usb_ids: Vec<(u16, u16)>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_aux_poll_ms")]
    pub aux_poll_interval_ms: u64,
    /// Give up waiting for AUX after this long; unset waits forever
    pub ready_timeout_ms: Option<u64>,
}

/// Frame extractor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingConfig {
    pub max_buffer_bytes: usize,
}

/// Receive loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    pub channel_capacity: usize,
}

/// PostgreSQL sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub create_table: bool,
}

/// InfluxDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxDbConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_url: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
}

fn default_gpio_chip() -> String {
    "/dev/gpiochip0".to_string()
}

fn default_usb_ids() -> Vec<(u16, u16)> {
    // CP210x and CH340 USB-UART bridges
    vec![(0x10C4, 0xEA60), (0x1A86, 0x7523)]
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout_ms() -> u64 {
    3000
}

fn default_aux_poll_ms() -> u64 {
    100
}

fn default_table() -> String {
    "grafana_schema.sensor_data".to_string()
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            channel_capacity: 100,
        }
    }
}

impl RadioConfig {
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            aux_poll_interval: Duration::from_millis(self.aux_poll_interval_ms),
            ready_timeout: self.ready_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// Environment variables override config file values:
    /// - RELAY_SERIAL_PORT: Use this serial device instead of USB discovery
    /// - POSTGRES_URL: Override PostgreSQL connection URL
    /// - INFLUXDB_TOKEN: Override InfluxDB token
    pub fn load(path: &str) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::parse(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        if let Ok(port) = std::env::var("RELAY_SERIAL_PORT") {
            tracing::info!(port = %port, "Using RELAY_SERIAL_PORT from environment");
            config.radio.serial_port = Some(port);
        }
        if let Ok(url) = std::env::var("POSTGRES_URL") {
            tracing::info!("Using POSTGRES_URL from environment");
            config.postgres.url = url;
        }
        if let Ok(token) = std::env::var("INFLUXDB_TOKEN") {
            if let Some(influxdb) = config.influxdb.as_mut() {
                tracing::info!("Using INFLUXDB_TOKEN from environment");
                influxdb.token = token;
            }
        }

        config.validate()?;

        Ok(config)
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let radio = &self.radio;

        if radio.m0_line == radio.m1_line
            || radio.m0_line == radio.aux_line
            || radio.m1_line == radio.aux_line
        {
            anyhow::bail!(
                "M0 ({}), M1 ({}) and AUX ({}) must be distinct GPIO lines",
                radio.m0_line,
                radio.m1_line,
                radio.aux_line
            );
        }

        if radio.serial_port.is_none() && radio.usb_ids.is_empty() {
            anyhow::bail!("Either radio.serial_port or radio.usb_ids must be set");
        }

        if radio.baud_rate == 0 {
            anyhow::bail!("radio.baud_rate must be greater than 0");
        }

        if radio.aux_poll_interval_ms == 0 {
            anyhow::bail!("radio.aux_poll_interval_ms must be greater than 0");
        }

        if self.framing.max_buffer_bytes == 0 {
            anyhow::bail!("framing.max_buffer_bytes must be greater than 0");
        }

        if self.relay.poll_interval_ms == 0 {
            anyhow::bail!("relay.poll_interval_ms must be greater than 0");
        }

        if self.relay.channel_capacity == 0 {
            anyhow::bail!("relay.channel_capacity must be greater than 0");
        }

        if !self.postgres.url.starts_with("postgres://")
            && !self.postgres.url.starts_with("postgresql://")
        {
            anyhow::bail!(
                "Invalid PostgreSQL URL: {} (must start with postgres:// or postgresql://)",
                self.postgres.url
            );
        }

        if let Some(influxdb) = &self.influxdb {
            if !influxdb.url.starts_with("http://") && !influxdb.url.starts_with("https://") {
                anyhow::bail!(
                    "Invalid InfluxDB URL: {} (must start with http:// or https://)",
                    influxdb.url
                );
            }
        }

        if let Some(mqtt) = &self.mqtt {
            if mqtt.qos > 2 {
                anyhow::bail!("Invalid MQTT QoS level: {} (must be 0, 1, or 2)", mqtt.qos);
            }
            if !mqtt.broker_url.starts_with("mqtt://") && !mqtt.broker_url.starts_with("mqtts://") {
                anyhow::bail!(
                    "Invalid MQTT broker URL: {} (must start with mqtt:// or mqtts://)",
                    mqtt.broker_url
                );
            }
        }

        Ok(())
    }
}
