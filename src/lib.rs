//! E220 LoRa ground-station relay library
//!
//! Drives an EBYTE E220 radio module through its mode and AUX lines, recovers
//! `<<<`/`>>>` framed JSON telemetry from the UART byte stream, and stores the
//! decoded readings.

pub mod config;
pub mod device;
pub mod error;
pub mod framing;
pub mod influxdb;
pub mod mqtt;
pub mod postgres;
pub mod radio;
pub mod relay;
pub mod sink;
pub mod status;
pub mod telemetry;

pub use error::{DeviceError, FrameError, SinkError};
pub use framing::{DecodedPacket, FrameExtractor};
pub use radio::{Mode, ModeController};
