//! Debounced status reporting for the radio controller.
//!
//! The controller polls AUX and the serial input many times per second, so
//! "still waiting" style messages must only be logged when the condition
//! changes. The notifier is injected so tests can observe what the controller
//! reported without scraping logs.

use tracing::{debug, info};

use crate::radio::Mode;

/// A condition the controller reports while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// AUX is low, the module is busy.
    WaitingForReady,
    /// AUX went high.
    Ready,
    /// Control lines were driven to a new mode.
    ModeSet(Mode),
    /// A receive poll found nothing pending.
    NoData,
    /// A receive poll returned this many bytes.
    DataReceived(usize),
}

/// Sink for controller status updates.
pub trait StatusNotifier {
    fn notify(&mut self, status: Status);
}

/// Class of a status used for debouncing. Byte counts do not matter, only
/// whether the condition changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    Busy,
    Ready,
    Idle,
    Receiving,
}

/// Logs each status through `tracing`, but only the first time a condition
/// is entered.
#[derive(Debug, Default)]
pub struct DebouncedLog {
    aux: Option<Condition>,
    input: Option<Condition>,
}

impl DebouncedLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusNotifier for DebouncedLog {
    fn notify(&mut self, status: Status) {
        match status {
            Status::WaitingForReady => {
                if self.aux.replace(Condition::Busy) != Some(Condition::Busy) {
                    info!("Waiting for AUX to go high");
                }
            }
            Status::Ready => {
                if self.aux.replace(Condition::Ready) != Some(Condition::Ready) {
                    info!("AUX is high, module ready");
                }
            }
            Status::ModeSet(mode) => {
                // A mode change always reopens the AUX wait.
                self.aux = None;
                info!(mode = ?mode, "Radio mode set");
            }
            Status::NoData => {
                if self.input.replace(Condition::Idle) != Some(Condition::Idle) {
                    info!("No data received");
                }
            }
            Status::DataReceived(len) => {
                self.input = Some(Condition::Receiving);
                debug!(bytes = len, "Received data from radio");
            }
        }
    }
}

/// Recording notifier used by tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub seen: std::sync::Arc<std::sync::Mutex<Vec<Status>>>,
}

#[cfg(test)]
impl StatusNotifier for Recorder {
    fn notify(&mut self, status: Status) {
        self.seen.lock().unwrap().push(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_tracks_transitions() {
        let mut log = DebouncedLog::new();

        log.notify(Status::WaitingForReady);
        assert_eq!(log.aux, Some(Condition::Busy));
        log.notify(Status::WaitingForReady);
        log.notify(Status::Ready);
        assert_eq!(log.aux, Some(Condition::Ready));

        log.notify(Status::ModeSet(Mode::Sleep));
        assert_eq!(log.aux, None);

        log.notify(Status::NoData);
        assert_eq!(log.input, Some(Condition::Idle));
        log.notify(Status::DataReceived(12));
        assert_eq!(log.input, Some(Condition::Receiving));
    }
}
