//! Flattening of decoded packets into storage rows
//!
//! The producer groups readings under top-level keys (`IMU`, `GPS`, `UV`,
//! `BMP`, `System`) plus a `timestamp`. Any group or field may be missing;
//! missing values stay `None` and are stored as NULL, never as zero.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::framing::DecodedPacket;

/// One row of the `sensor_data` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryRecord {
    // IMU
    pub acelx: Option<f64>,
    pub acely: Option<f64>,
    pub acelz: Option<f64>,
    pub girox: Option<f64>,
    pub giroy: Option<f64>,
    pub giroz: Option<f64>,
    pub magx: Option<f64>,
    pub magy: Option<f64>,
    pub magz: Option<f64>,
    // UV
    pub uva: Option<f64>,
    pub uvb: Option<f64>,
    pub uvc: Option<f64>,
    pub uv_temp: Option<f64>,
    // Host system
    pub cpu_usage: Option<f64>,
    pub ram_usage: Option<f64>,
    pub total_ram: Option<f64>,
    pub disk_usage: Option<f64>,
    pub disk_usage_gb: Option<f64>,
    pub total_disk_gb: Option<f64>,
    pub temperature: Option<f64>,
    // GPS
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub headmot: Option<f64>,
    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub heading: Option<f64>,
    pub nmea: Option<String>,
    pub lat_hp: Option<f64>,
    pub lon_hp: Option<f64>,
    pub alt_hp: Option<f64>,
    pub gps_error: Option<f64>,
    /// Textual GPS error ("Error: GPS port not found"); logged, not stored.
    pub gps_error_message: Option<String>,
    // Barometer
    pub pressure: Option<f64>,
    pub bmp_temperature: Option<f64>,
    pub bmp_altitude: Option<f64>,

    pub timestamp: Option<NaiveDateTime>,
}

impl TelemetryRecord {
    pub fn from_packet(packet: &DecodedPacket) -> Self {
        let imu = Group::new(packet, "IMU");
        let uv = Group::new(packet, "UV");
        let system = Group::new(packet, "System");
        let gps = Group::new(packet, "GPS");
        let bmp = Group::new(packet, "BMP");

        let (gps_error, gps_error_message) = match gps.get("error") {
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) => (Some(v), None),
                Err(_) => (None, Some(s.clone())),
            },
            Some(v) => (as_f64(v), None),
            None => (None, None),
        };

        Self {
            acelx: imu.number("ACELX"),
            acely: imu.number("ACELY"),
            acelz: imu.number("ACELZ"),
            girox: imu.number("GIROX"),
            giroy: imu.number("GIROY"),
            giroz: imu.number("GIROZ"),
            magx: imu.number("MAGX"),
            magy: imu.number("MAGY"),
            magz: imu.number("MAGZ"),
            uva: uv.number("UVA"),
            uvb: uv.number("UVB"),
            uvc: uv.number("UVC"),
            uv_temp: uv.number("UV Temp"),
            cpu_usage: system.number("CPU Usage (%)"),
            ram_usage: system.number("RAM Usage (MB)"),
            total_ram: system.number("Total RAM (MB)"),
            disk_usage: system.number("Disk Usage (%)"),
            disk_usage_gb: system.number("Disk Usage (GB)"),
            total_disk_gb: system.number("Total Disk (GB)"),
            temperature: system.number("Temperature (°C)"),
            lat: gps.number("lat"),
            lon: gps.number("lon"),
            alt: gps.number("alt"),
            headmot: gps.number("headmot"),
            roll: gps.number("roll"),
            pitch: gps.number("pitch"),
            heading: gps.number("heading"),
            nmea: gps.text("NMEA"),
            lat_hp: gps.number("latHp"),
            lon_hp: gps.number("lonHp"),
            alt_hp: gps.number("altHp"),
            gps_error,
            gps_error_message,
            pressure: bmp.number("pressure"),
            bmp_temperature: bmp.number("temperature"),
            bmp_altitude: bmp.number("altitude"),
            timestamp: packet.get("timestamp").and_then(parse_timestamp),
        }
    }

    /// Every numeric column as `(group, field, value)`, in column order.
    pub fn numeric_fields(&self) -> [(&'static str, &'static str, Option<f64>); 34] {
        [
            ("imu", "acelx", self.acelx),
            ("imu", "acely", self.acely),
            ("imu", "acelz", self.acelz),
            ("imu", "girox", self.girox),
            ("imu", "giroy", self.giroy),
            ("imu", "giroz", self.giroz),
            ("imu", "magx", self.magx),
            ("imu", "magy", self.magy),
            ("imu", "magz", self.magz),
            ("uv", "uva", self.uva),
            ("uv", "uvb", self.uvb),
            ("uv", "uvc", self.uvc),
            ("uv", "uv_temp", self.uv_temp),
            ("system", "cpu_usage", self.cpu_usage),
            ("system", "ram_usage", self.ram_usage),
            ("system", "total_ram", self.total_ram),
            ("system", "disk_usage", self.disk_usage),
            ("system", "disk_usage_gb", self.disk_usage_gb),
            ("system", "total_disk_gb", self.total_disk_gb),
            ("system", "temperature", self.temperature),
            ("gps", "lat", self.lat),
            ("gps", "lon", self.lon),
            ("gps", "alt", self.alt),
            ("gps", "headmot", self.headmot),
            ("gps", "roll", self.roll),
            ("gps", "pitch", self.pitch),
            ("gps", "heading", self.heading),
            ("gps", "lat_hp", self.lat_hp),
            ("gps", "lon_hp", self.lon_hp),
            ("gps", "alt_hp", self.alt_hp),
            ("gps", "gps_error", self.gps_error),
            ("bmp", "pressure", self.pressure),
            ("bmp", "bmp_temperature", self.bmp_temperature),
            ("bmp", "bmp_altitude", self.bmp_altitude),
        ]
    }

    /// Number of populated columns, timestamp and NMEA included.
    pub fn populated(&self) -> usize {
        self.numeric_fields()
            .iter()
            .filter(|(_, _, v)| v.is_some())
            .count()
            + usize::from(self.nmea.is_some())
            + usize::from(self.timestamp.is_some())
    }
}

/// View over one top-level group. A missing or non-object group behaves as
/// empty.
struct Group<'a>(Option<&'a serde_json::Map<String, Value>>);

impl<'a> Group<'a> {
    fn new(packet: &'a DecodedPacket, key: &str) -> Self {
        Group(packet.get(key).and_then(Value::as_object))
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.and_then(|group| group.get(key))
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(as_f64)
    }

    fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Numbers, or numeric strings as some producers send them.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}
