//! Receive and processing loops.
//!
//! Architecture: UART → receive loop (blocking thread, owns controller and
//! extractor) → bounded channel → processor task → sinks.
//!
//! The channel has exactly one producer and one consumer, so packets reach the
//! sinks in the order their end markers arrived on the wire.

use std::thread;
use std::time::Duration;

use embedded_hal::digital::{InputPin, OutputPin};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::error::DeviceResult;
use crate::framing::{DecodedPacket, FrameExtractor};
use crate::radio::{DataChannel, ModeController};
use crate::sink::TelemetrySink;
use crate::status::StatusNotifier;
use crate::telemetry::TelemetryRecord;

/// Why the receive loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown signal was raised.
    Shutdown,
    /// The processor dropped its end of the channel.
    ConsumerClosed,
}

/// Poll the radio until shutdown, feeding every chunk to the extractor and
/// forwarding decoded packets in order.
///
/// Malformed frames and buffer overflows are logged and skipped. Channel I/O
/// errors end the loop; reconnecting is up to the caller.
pub fn receive_loop<M0, M1, A, C, N>(
    controller: &mut ModeController<M0, M1, A, C, N>,
    extractor: &mut FrameExtractor,
    tx: &mpsc::Sender<DecodedPacket>,
    shutdown: &watch::Receiver<bool>,
    poll_interval: Duration,
) -> DeviceResult<LoopExit>
where
    M0: OutputPin,
    M1: OutputPin,
    A: InputPin,
    C: DataChannel,
    N: StatusNotifier,
{
    info!(poll_ms = poll_interval.as_millis() as u64, "Listening for incoming messages");

    loop {
        if let Some(chunk) = controller.receive()? {
            extractor.push(&chunk);

            for frame in extractor.frames() {
                match frame {
                    Ok(packet) => {
                        if tx.blocking_send(packet).is_err() {
                            warn!("Packet processor is gone, stopping receive loop");
                            return Ok(LoopExit::ConsumerClosed);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Discarded frame");
                    }
                }
            }
        }

        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            info!("Shutdown requested, stopping receive loop");
            return Ok(LoopExit::Shutdown);
        }

        thread::sleep(poll_interval);
    }
}

/// Counters reported when the processor stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub received: u64,
    pub persisted: u64,
    pub failed: u64,
}

/// Flatten and persist packets until the receive side closes the channel.
pub async fn process_packets<S: TelemetrySink>(
    mut rx: mpsc::Receiver<DecodedPacket>,
    sink: S,
) -> ProcessStats {
    info!(sink = sink.name(), "Starting telemetry processor");
    let mut stats = ProcessStats::default();

    while let Some(packet) = rx.recv().await {
        stats.received += 1;
        let record = TelemetryRecord::from_packet(&packet);

        info!(
            timestamp = ?record.timestamp,
            fields = record.populated(),
            lat = ?record.lat,
            lon = ?record.lon,
            alt = ?record.alt,
            pressure = ?record.pressure,
            cpu_usage = ?record.cpu_usage,
            "Telemetry packet received"
        );
        if let Some(message) = &record.gps_error_message {
            warn!(error = %message, "Producer reported a GPS error");
        }

        match sink.persist(&record).await {
            Ok(()) => stats.persisted += 1,
            Err(e) => {
                stats.failed += 1;
                error!(error = %e, "Failed to persist telemetry");
            }
        }
    }

    info!(
        received = stats.received,
        persisted = stats.persisted,
        failed = stats.failed,
        "Telemetry processor stopped"
    );
    stats
}
