//! Hardware binding for the radio module on a Linux host.
//!
//! Finds the USB-UART bridge the E220 sits behind, opens it 8N1, and requests
//! M0/M1/AUX from a GPIO character device.

use std::time::Duration;

use gpio_cdev::{Chip, LineRequestFlags};
use linux_embedded_hal::CdevPin;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, info};

use crate::config::RadioConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::radio::ModeController;
use crate::status::DebouncedLog;

/// Controller bound to real GPIO lines and a serial port.
pub type E220 =
    ModeController<CdevPin, CdevPin, CdevPin, Box<dyn SerialPort>, DebouncedLog>;

const CONSUMER: &str = "e220-relay";

/// Open every line and the UART described by `config` and bring the module
/// up in normal mode.
pub fn open(config: &RadioConfig) -> DeviceResult<E220> {
    let port_name = match &config.serial_port {
        Some(port) => port.clone(),
        None => find_port(&config.usb_ids)?,
    };
    info!(port = %port_name, "Radio found, initializing E220 module");

    let channel = open_serial(&port_name, config.baud_rate, config.read_timeout())?;

    let mut chip = Chip::new(&config.gpio_chip)
        .map_err(|e| DeviceError::Init(format!("GPIO chip {}: {}", config.gpio_chip, e)))?;
    let m0 = request_line(&mut chip, config.m0_line, LineRequestFlags::OUTPUT, "M0")?;
    let m1 = request_line(&mut chip, config.m1_line, LineRequestFlags::OUTPUT, "M1")?;
    let aux = request_line(&mut chip, config.aux_line, LineRequestFlags::INPUT, "AUX")?;

    ModeController::initialize(
        m0,
        m1,
        aux,
        channel,
        config.controller(),
        DebouncedLog::new(),
    )
}

/// Name of the first serial port whose USB ids match one of `usb_ids`.
pub fn find_port(usb_ids: &[(u16, u16)]) -> DeviceResult<String> {
    let ports = serialport::available_ports()
        .map_err(|e| DeviceError::Init(format!("Failed to list serial ports: {}", e)))?;
    debug!(count = ports.len(), "Enumerated serial ports");

    match_port(&ports, usb_ids).ok_or_else(|| {
        DeviceError::Init("No serial port matches the configured USB ids".to_string())
    })
}

/// The configured id order is the preference order.
fn match_port(ports: &[SerialPortInfo], usb_ids: &[(u16, u16)]) -> Option<String> {
    usb_ids.iter().find_map(|&(vid, pid)| {
        ports.iter().find_map(|port| match &port.port_type {
            SerialPortType::UsbPort(usb) if usb.vid == vid && usb.pid == pid => {
                Some(port.port_name.clone())
            }
            _ => None,
        })
    })
}

fn open_serial(
    port_name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> DeviceResult<Box<dyn SerialPort>> {
    serialport::new(port_name, baud_rate)
        .timeout(timeout)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .open()
        .map_err(|e| {
            DeviceError::Init(format!("Failed to open serial port {}: {}", port_name, e))
        })
}

fn request_line(
    chip: &mut Chip,
    offset: u32,
    flags: LineRequestFlags,
    name: &str,
) -> DeviceResult<CdevPin> {
    let init_err = |e: gpio_cdev::errors::Error| {
        DeviceError::Init(format!("GPIO line {} ({}): {}", offset, name, e))
    };

    let handle = chip
        .get_line(offset)
        .and_then(|line| line.request(flags, 0, CONSUMER))
        .map_err(init_err)?;
    CdevPin::new(handle).map_err(init_err)
}
