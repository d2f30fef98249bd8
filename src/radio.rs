//! EBYTE E220 mode controller
//!
//! The module is driven through two mode-select lines (M0, M1), one
//! ready/busy line (AUX, high = ready) and a UART. Every mode change and every
//! transmit is complete only once AUX reads high again.
//!
//! The controller is generic over the `embedded-hal` digital pin traits and a
//! [`DataChannel`], so the same code runs against Linux GPIO character devices
//! and in-memory fakes.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use embedded_hal::digital::{InputPin, OutputPin};
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::framing;
use crate::status::{DebouncedLog, Status, StatusNotifier};

/// Operating mode of the radio module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    WorTransmit,
    WorReceive,
    Sleep,
}

impl Mode {
    /// Line levels `(M0, M1)` selecting this mode.
    pub fn levels(self) -> (bool, bool) {
        match self {
            Mode::Normal => (false, false),
            Mode::WorTransmit => (false, true),
            Mode::WorReceive => (true, false),
            Mode::Sleep => (true, true),
        }
    }

    pub fn from_levels(m0: bool, m1: bool) -> Self {
        match (m0, m1) {
            (false, false) => Mode::Normal,
            (false, true) => Mode::WorTransmit,
            (true, false) => Mode::WorReceive,
            (true, true) => Mode::Sleep,
        }
    }
}

/// Byte channel to the module (the UART in production).
pub trait DataChannel {
    /// Number of bytes that can be read without blocking.
    fn pending(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` already-buffered bytes.
    fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole payload and flush it to the wire.
    fn write_payload(&mut self, data: &[u8]) -> io::Result<()>;
}

impl DataChannel for Box<dyn SerialPort> {
    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write_payload(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, data)?;
        io::Write::flush(self)
    }
}

/// Timing parameters for the AUX handshake.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Sleep between AUX reads while the module is busy.
    pub aux_poll_interval: Duration,
    /// Give up waiting for AUX after this long. `None` waits forever.
    pub ready_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            aux_poll_interval: Duration::from_millis(100),
            ready_timeout: None,
        }
    }
}

/// Single point of control over the module's lines and UART.
pub struct ModeController<M0, M1, A, C, N = DebouncedLog> {
    m0: M0,
    m1: M1,
    aux: A,
    channel: C,
    notifier: N,
    mode: Mode,
    config: ControllerConfig,
}

impl<M0, M1, A, C, N> ModeController<M0, M1, A, C, N>
where
    M0: OutputPin,
    M1: OutputPin,
    A: InputPin,
    C: DataChannel,
    N: StatusNotifier,
{
    /// Take ownership of the opened lines and channel, select NORMAL mode and
    /// wait for the module to report ready.
    pub fn initialize(
        m0: M0,
        m1: M1,
        aux: A,
        channel: C,
        config: ControllerConfig,
        notifier: N,
    ) -> DeviceResult<Self> {
        let mut controller = Self {
            m0,
            m1,
            aux,
            channel,
            notifier,
            mode: Mode::Normal,
            config,
        };
        controller.set_mode(Mode::Normal)?;
        info!("Radio module initialized in normal mode");
        Ok(controller)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Drive the mode lines for `mode` and block until AUX reports ready.
    pub fn set_mode(&mut self, mode: Mode) -> DeviceResult<()> {
        let (m0, m1) = mode.levels();
        let previous_m0 = self.mode.levels().0;

        drive(&mut self.m0, m0, "M0")?;
        if let Err(e) = drive(&mut self.m1, m1, "M1") {
            // Put M0 back so the lines still encode the previous mode.
            if let Err(rollback) = drive(&mut self.m0, previous_m0, "M0") {
                warn!(
                    mode = ?self.mode,
                    error = %rollback,
                    "Failed to restore M0, mode lines no longer match the reported mode"
                );
            }
            return Err(e);
        }

        self.mode = mode;
        self.notifier.notify(Status::ModeSet(mode));
        self.wait_ready()
    }

    /// Write `payload` to the UART and wait until the module has clocked it out.
    pub fn send(&mut self, payload: &[u8]) -> DeviceResult<()> {
        self.channel.write_payload(payload)?;
        debug!(bytes = payload.len(), "Sent data to radio");
        self.wait_ready()
    }

    /// Wrap a JSON value in frame markers and send it.
    pub fn send_packet(&mut self, packet: &serde_json::Value) -> DeviceResult<()> {
        let frame = framing::encode_frame(packet);
        self.send(&frame)
    }

    /// Return every byte currently buffered by the UART, or `None` when nothing
    /// is pending. Never blocks waiting for input.
    pub fn receive(&mut self) -> DeviceResult<Option<Vec<u8>>> {
        let pending = self.channel.pending()?;
        if pending == 0 {
            self.notifier.notify(Status::NoData);
            return Ok(None);
        }

        let mut buf = vec![0u8; pending];
        let read = self.channel.read_pending(&mut buf)?;
        if read == 0 {
            self.notifier.notify(Status::NoData);
            return Ok(None);
        }
        buf.truncate(read);
        self.notifier.notify(Status::DataReceived(read));
        Ok(Some(buf))
    }

    pub fn sleep(&mut self) -> DeviceResult<()> {
        self.set_mode(Mode::Sleep)
    }

    pub fn wake(&mut self) -> DeviceResult<()> {
        self.set_mode(Mode::Normal)
    }

    /// Release the data channel. The pins are handed back untouched so the
    /// lines keep their last driven level for as long as the caller holds them.
    pub fn close(self) -> (M0, M1, A) {
        let Self {
            m0, m1, aux, channel, mode, ..
        } = self;
        drop(channel);
        info!(mode = ?mode, "Serial channel closed");
        (m0, m1, aux)
    }

    fn wait_ready(&mut self) -> DeviceResult<()> {
        let started = Instant::now();
        loop {
            let ready = self.aux.is_high().map_err(|e| DeviceError::LineIo {
                line: "AUX",
                reason: format!("{:?}", e),
            })?;
            if ready {
                self.notifier.notify(Status::Ready);
                return Ok(());
            }

            self.notifier.notify(Status::WaitingForReady);
            if let Some(limit) = self.config.ready_timeout {
                if started.elapsed() >= limit {
                    return Err(DeviceError::ReadyTimeout(limit));
                }
            }
            thread::sleep(self.config.aux_poll_interval);
        }
    }
}

fn drive<P: OutputPin>(pin: &mut P, high: bool, line: &'static str) -> DeviceResult<()> {
    let result = if high { pin.set_high() } else { pin.set_low() };
    result.map_err(|e| DeviceError::LineIo {
        line,
        reason: format!("{:?}", e),
    })
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use embedded_hal::digital::{ErrorKind, ErrorType};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct FakeOutput {
        pub level: Arc<Mutex<bool>>,
        /// Writes that still succeed. `None` means unlimited.
        pub writes_left: Arc<Mutex<Option<usize>>>,
    }

    impl FakeOutput {
        pub fn failing_after(writes: usize) -> Self {
            let pin = Self::default();
            *pin.writes_left.lock().unwrap() = Some(writes);
            pin
        }

        fn write(&mut self, high: bool) -> Result<(), ErrorKind> {
            let mut writes_left = self.writes_left.lock().unwrap();
            match *writes_left {
                Some(0) => return Err(ErrorKind::Other),
                Some(ref mut left) => *left -= 1,
                None => {}
            }
            *self.level.lock().unwrap() = high;
            Ok(())
        }
    }

    impl ErrorType for FakeOutput {
        type Error = ErrorKind;
    }

    impl OutputPin for FakeOutput {
        fn set_low(&mut self) -> Result<(), ErrorKind> {
            self.write(false)
        }

        fn set_high(&mut self) -> Result<(), ErrorKind> {
            self.write(true)
        }
    }

    /// AUX that replays a script of levels, then stays high.
    #[derive(Clone, Default)]
    pub struct FakeAux {
        pub script: Arc<Mutex<VecDeque<bool>>>,
        pub reads: Arc<Mutex<usize>>,
    }

    impl FakeAux {
        pub fn busy_for(reads: usize) -> Self {
            let aux = Self::default();
            aux.script.lock().unwrap().extend(std::iter::repeat(false).take(reads));
            aux
        }
    }

    impl ErrorType for FakeAux {
        type Error = ErrorKind;
    }

    impl InputPin for FakeAux {
        fn is_high(&mut self) -> Result<bool, ErrorKind> {
            *self.reads.lock().unwrap() += 1;
            Ok(self.script.lock().unwrap().pop_front().unwrap_or(true))
        }

        fn is_low(&mut self) -> Result<bool, ErrorKind> {
            self.is_high().map(|high| !high)
        }
    }

    /// In-memory UART fed with scripted chunks.
    #[derive(Clone, Default)]
    pub struct FakeChannel {
        pub incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub written: Arc<Mutex<Vec<u8>>>,
        pub fail_reads: bool,
        pub fail_writes: bool,
    }

    impl FakeChannel {
        pub fn with_chunks<I, B>(chunks: I) -> Self
        where
            I: IntoIterator<Item = B>,
            B: AsRef<[u8]>,
        {
            let channel = Self::default();
            channel
                .incoming
                .lock()
                .unwrap()
                .extend(chunks.into_iter().map(|c| c.as_ref().to_vec()));
            channel
        }
    }

    impl DataChannel for FakeChannel {
        fn pending(&mut self) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "uart unplugged"));
            }
            Ok(self.incoming.lock().unwrap().front().map_or(0, Vec::len))
        }

        fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut incoming = self.incoming.lock().unwrap();
            let Some(chunk) = incoming.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                incoming.push_front(chunk[n..].to_vec());
            }
            Ok(n)
        }

        fn write_payload(&mut self, data: &[u8]) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "uart gone"));
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }
    }

    pub fn fast_config() -> ControllerConfig {
        ControllerConfig {
            aux_poll_interval: Duration::from_millis(1),
            ready_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::status::Recorder;

    type TestController = ModeController<FakeOutput, FakeOutput, FakeAux, FakeChannel, Recorder>;

    fn controller(
        aux: FakeAux,
        channel: FakeChannel,
    ) -> (TestController, FakeOutput, FakeOutput, Recorder) {
        let m0 = FakeOutput::default();
        let m1 = FakeOutput::default();
        let recorder = Recorder::default();
        let controller = ModeController::initialize(
            m0.clone(),
            m1.clone(),
            aux,
            channel,
            fast_config(),
            recorder.clone(),
        )
        .unwrap();
        (controller, m0, m1, recorder)
    }

    #[test]
    fn test_mode_truth_table() {
        assert_eq!(Mode::Normal.levels(), (false, false));
        assert_eq!(Mode::WorTransmit.levels(), (false, true));
        assert_eq!(Mode::WorReceive.levels(), (true, false));
        assert_eq!(Mode::Sleep.levels(), (true, true));

        for mode in [Mode::Normal, Mode::WorTransmit, Mode::WorReceive, Mode::Sleep] {
            let (m0, m1) = mode.levels();
            assert_eq!(Mode::from_levels(m0, m1), mode);
        }
    }

    #[test]
    fn test_initialize_waits_for_aux() {
        let aux = FakeAux::busy_for(3);
        let (controller, m0, m1, recorder) = controller(aux.clone(), FakeChannel::default());

        assert_eq!(controller.mode(), Mode::Normal);
        assert!(!*m0.level.lock().unwrap());
        assert!(!*m1.level.lock().unwrap());
        assert!(aux.script.lock().unwrap().is_empty());
        assert_eq!(*aux.reads.lock().unwrap(), 4);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&Status::Ready));
        assert_eq!(seen.iter().filter(|s| **s == Status::WaitingForReady).count(), 3);
    }

    #[test]
    fn test_set_mode_drives_lines_and_blocks_until_ready() {
        let aux = FakeAux::default();
        let (mut controller, m0, m1, _) = controller(aux.clone(), FakeChannel::default());

        for mode in [Mode::WorTransmit, Mode::WorReceive, Mode::Sleep, Mode::Normal] {
            aux.script.lock().unwrap().extend([false, false]);
            controller.set_mode(mode).unwrap();

            // Every scripted busy read was consumed before returning.
            assert!(aux.script.lock().unwrap().is_empty());
            assert_eq!(controller.mode(), mode);
            assert_eq!(
                (*m0.level.lock().unwrap(), *m1.level.lock().unwrap()),
                mode.levels()
            );
        }
    }

    #[test]
    fn test_sleep_and_wake() {
        let (mut controller, m0, m1, _) = controller(FakeAux::default(), FakeChannel::default());

        controller.sleep().unwrap();
        assert_eq!(controller.mode(), Mode::Sleep);
        assert!(*m0.level.lock().unwrap() && *m1.level.lock().unwrap());

        controller.wake().unwrap();
        assert_eq!(controller.mode(), Mode::Normal);
        assert!(!*m0.level.lock().unwrap() && !*m1.level.lock().unwrap());
    }

    #[test]
    fn test_line_failure_keeps_previous_mode() {
        let m0 = FakeOutput::default();
        let m1 = FakeOutput::failing_after(0);
        let result = ModeController::initialize(
            m0.clone(),
            m1,
            FakeAux::default(),
            FakeChannel::default(),
            fast_config(),
            Recorder::default(),
        );

        match result {
            Err(DeviceError::LineIo { line, .. }) => assert_eq!(line, "M1"),
            _ => panic!("expected M1 line error"),
        }
        assert!(!*m0.level.lock().unwrap());
    }

    #[test]
    fn test_failed_rollback_still_reports_line_error() {
        // M0: init + set_mode succeed, the rollback write fails.
        let m0 = FakeOutput::failing_after(2);
        // M1: init succeeds, the mode change fails.
        let m1 = FakeOutput::failing_after(1);
        let mut controller = ModeController::initialize(
            m0.clone(),
            m1.clone(),
            FakeAux::default(),
            FakeChannel::default(),
            fast_config(),
            Recorder::default(),
        )
        .unwrap();

        match controller.set_mode(Mode::WorReceive) {
            Err(DeviceError::LineIo { line, .. }) => assert_eq!(line, "M1"),
            other => panic!("expected M1 line error, got {:?}", other.err()),
        }
        assert_eq!(controller.mode(), Mode::Normal);
        // M0 is stuck high since the rollback could not be driven.
        assert!(*m0.level.lock().unwrap());
        assert!(!*m1.level.lock().unwrap());
    }

    #[test]
    fn test_ready_timeout() {
        let aux = FakeAux::busy_for(1000);
        let mut config = fast_config();
        config.ready_timeout = Some(Duration::from_millis(5));

        let result = ModeController::initialize(
            FakeOutput::default(),
            FakeOutput::default(),
            aux,
            FakeChannel::default(),
            config,
            Recorder::default(),
        );
        assert!(matches!(result, Err(DeviceError::ReadyTimeout(_))));
    }

    #[test]
    fn test_send_writes_and_waits() {
        let aux = FakeAux::default();
        let channel = FakeChannel::default();
        let (mut controller, _, _, _) = controller(aux.clone(), channel.clone());

        aux.script.lock().unwrap().extend([false, false]);
        controller.send(b"hello").unwrap();

        assert_eq!(channel.written.lock().unwrap().as_slice(), b"hello");
        assert!(aux.script.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_packet_frames_payload() {
        let channel = FakeChannel::default();
        let (mut controller, _, _, _) = controller(FakeAux::default(), channel.clone());

        controller.send_packet(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(channel.written.lock().unwrap().as_slice(), br#"<<<{"a":1}>>>"#);
    }

    #[test]
    fn test_send_failure_is_channel_error() {
        let channel = FakeChannel {
            fail_writes: true,
            ..FakeChannel::default()
        };
        let (mut controller, _, _, _) = controller(FakeAux::default(), channel);

        assert!(matches!(controller.send(b"x"), Err(DeviceError::ChannelIo(_))));
    }

    #[test]
    fn test_receive_returns_buffered_bytes() {
        let channel = FakeChannel::with_chunks(["<<<{\"a\"", ":1}>>>"]);
        let (mut controller, _, _, recorder) = controller(FakeAux::default(), channel);

        assert_eq!(controller.receive().unwrap().unwrap(), b"<<<{\"a\"");
        assert_eq!(controller.receive().unwrap().unwrap(), b":1}>>>");
        assert_eq!(controller.receive().unwrap(), None);

        let seen = recorder.seen.lock().unwrap();
        assert!(seen.contains(&Status::DataReceived(7)));
        assert_eq!(seen.last(), Some(&Status::NoData));
    }

    #[test]
    fn test_receive_never_blocks_when_idle() {
        let (mut controller, _, _, _) = controller(FakeAux::default(), FakeChannel::default());

        let started = Instant::now();
        for _ in 0..100 {
            assert_eq!(controller.receive().unwrap(), None);
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_close_returns_pins_at_last_level() {
        let (mut controller, _, _, _) = controller(FakeAux::default(), FakeChannel::default());
        controller.sleep().unwrap();

        let (m0, m1, _) = controller.close();
        assert!(*m0.level.lock().unwrap());
        assert!(*m1.level.lock().unwrap());
    }
}
