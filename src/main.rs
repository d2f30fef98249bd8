//! E220 Ground-Station Relay
//!
//! This service:
//! - Finds the USB-UART bridge of the EBYTE E220 radio and brings it up in
//!   normal mode (M0/M1 low, waits for AUX)
//! - Polls the UART and recovers `<<<`/`>>>` framed JSON telemetry
//! - Writes every packet to PostgreSQL, and optionally InfluxDB and MQTT
//!
//! Architecture: UART → receive loop → framer → channel → processor → sinks

use std::process::ExitCode;

use anyhow::{Context, Result};
use e220_relay::config::Config;
use e220_relay::device;
use e220_relay::framing::FrameExtractor;
use e220_relay::influxdb::InfluxDbClient;
use e220_relay::mqtt::MqttClient;
use e220_relay::postgres::PostgresSink;
use e220_relay::relay::{self, LoopExit};
use e220_relay::sink::{Sink, SinkSet};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Set up every configured sink. PostgreSQL is always configured, but an
/// unreachable server only delays its first row.
async fn connect_sinks(config: &Config) -> Result<SinkSet> {
    let mut sinks = SinkSet::new();

    let postgres = PostgresSink::open(
        &config.postgres.url,
        &config.postgres.table,
        config.postgres.create_table,
    )
    .await
    .context("Invalid PostgreSQL sink configuration")?;
    sinks.push(Sink::Postgres(postgres));

    if let Some(influxdb) = &config.influxdb {
        let client = InfluxDbClient::new(
            &influxdb.url,
            &influxdb.org,
            &influxdb.bucket,
            &influxdb.token,
        )
        .context("Failed to create InfluxDB client")?;
        client
            .health_check()
            .await
            .context("InfluxDB health check failed")?;
        sinks.push(Sink::InfluxDb(client));
    }

    if let Some(mqtt) = &config.mqtt {
        let client = MqttClient::new(
            &mqtt.broker_url,
            &mqtt.client_id,
            &mqtt.topic_prefix,
            mqtt.qos,
        )
        .await
        .context("Failed to create MQTT client")?;
        sinks.push(Sink::Mqtt(client));
    }

    info!(count = sinks.len(), "Sinks configured");
    Ok(sinks)
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path))?;
    info!(path = %config_path, "Configuration loaded successfully");

    let sinks = connect_sinks(&config).await?;

    // Mode changes block on AUX, keep them off the async workers.
    let radio_config = config.radio.clone();
    let mut radio = tokio::task::spawn_blocking(move || device::open(&radio_config))
        .await
        .context("Radio initialization task panicked")?
        .context("Failed to initialize E220 module")?;

    let (tx, rx) = mpsc::channel(config.relay.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = config.relay.poll_interval();
    let max_buffer = config.framing.max_buffer_bytes;

    let mut receiver_handle = tokio::task::spawn_blocking(move || {
        let mut extractor = FrameExtractor::with_max_buffer(max_buffer);
        let result = relay::receive_loop(
            &mut radio,
            &mut extractor,
            &tx,
            &shutdown_rx,
            poll_interval,
        );
        // Lines stay at their last level until the process exits.
        let _lines = radio.close();
        result
    });

    let processor_handle = tokio::spawn(relay::process_packets(rx, sinks));

    info!("Relay running. Press Ctrl+C to stop.");
    let receive_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully");
            shutdown_tx.send(true).ok();
            (&mut receiver_handle).await
        }
        result = &mut receiver_handle => {
            warn!("Receive loop ended unexpectedly");
            result
        }
    };

    // The receive loop owned the only sender, so the processor drains what is
    // queued and stops.
    match processor_handle.await {
        Ok(stats) => info!(
            received = stats.received,
            persisted = stats.persisted,
            failed = stats.failed,
            "Processor finished"
        ),
        Err(e) => error!(error = %e, "Processor task failed"),
    }

    match receive_result.context("Receive loop task panicked")? {
        Ok(LoopExit::Shutdown) => {
            info!("E220 relay stopped");
            Ok(())
        }
        Ok(LoopExit::ConsumerClosed) => {
            anyhow::bail!("Packet processor stopped before the receive loop")
        }
        Err(e) => Err(e).context("Radio channel failed"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("E220 ground-station relay starting");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Relay stopped with error");
            ExitCode::FAILURE
        }
    }
}
