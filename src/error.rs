//! Error types for the relay library.
//!
//! The binary wraps these in `anyhow` at its edges; library code returns the
//! typed variants so callers can decide what is fatal.

use thiserror::Error;

/// Failures raised by the radio module controller.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// A control line or the serial channel could not be opened.
    #[error("Device initialization failed: {0}")]
    Init(String),

    /// Writing a mode line or reading the AUX line failed.
    #[error("Control line I/O error on {line}: {reason}")]
    LineIo { line: &'static str, reason: String },

    /// Reading from or writing to the serial channel failed.
    #[error("Serial channel I/O error: {0}")]
    ChannelIo(#[from] std::io::Error),

    /// AUX stayed low longer than the configured ready timeout.
    #[error("Module not ready after {0:?}")]
    ReadyTimeout(std::time::Duration),
}

/// Failures reported by the frame extractor.
///
/// None of these stop extraction; the offending bytes are already discarded
/// when the error is returned.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The span between the markers was not a JSON object.
    #[error("Malformed payload {span:?}: {source}")]
    MalformedPayload {
        span: String,
        #[source]
        source: serde_json::Error,
    },

    /// No frame closed before the buffer reached its limit.
    #[error("Frame buffer overflow: {len} bytes retained (max {max})")]
    BufferOverflow { len: usize, max: usize },
}

/// Failure of one storage backend to persist a record.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{backend} sink failed to persist record: {reason}")]
    Persist { backend: &'static str, reason: String },
}

impl SinkError {
    pub fn persist(backend: &'static str, err: impl std::fmt::Display) -> Self {
        SinkError::Persist {
            backend,
            reason: err.to_string(),
        }
    }
}

/// Result type alias for controller operations.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
