//! Sentinel-delimited packet framing.
//!
//! The producer wraps every JSON object as `<<<` + JSON + `>>>`. There is no
//! length prefix, checksum or escaping, so the extractor recovers frames by
//! marker search over an accumulating buffer:
//!
//! - the first start marker in the buffer opens the frame
//! - the first end marker after it closes the frame
//! - everything up to and including the end marker is then dropped, whether
//!   or not the span parses
//!
//! A second `<<<` before the first frame closes is not treated specially: the
//! first start marker still governs, so the bytes in between end up inside
//! the next payload (which then usually fails to parse).
//!
//! The buffer is bounded. Once it grows past the limit, noise ahead of the
//! open frame is trimmed first, so line noise alone never causes an overflow
//! and never cuts into a frame that is still arriving. Only an open frame that
//! is itself larger than the limit is abandoned and reported.
//!
//! # Example
//!
//! ```ignore
//! let mut extractor = FrameExtractor::new();
//! extractor.push(b"noise<<<{\"a\":1}>>>");
//! for frame in extractor.frames() {
//!     match frame {
//!         Ok(packet) => println!("{:?}", packet),
//!         Err(e) => eprintln!("{}", e),
//!     }
//! }
//! ```

use bytes::{Buf, BytesMut};
use serde_json::{Map, Value};

use crate::error::FrameError;

/// Opens a frame.
pub const START_MARKER: &[u8] = b"<<<";
/// Closes a frame.
pub const END_MARKER: &[u8] = b">>>";

/// Default limit on bytes retained while waiting for a frame to close.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// One decoded telemetry snapshot: the JSON object found between the markers.
pub type DecodedPacket = Map<String, Value>;

/// Turns arbitrarily split chunks of the radio byte stream into packets.
pub struct FrameExtractor {
    buffer: BytesMut,
    max_buffer: usize,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_buffer.min(DEFAULT_MAX_BUFFER)),
            max_buffer,
        }
    }

    /// Append a chunk verbatim. Frames are extracted lazily by
    /// [`next_frame`](Self::next_frame) or [`frames`](Self::frames).
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Append a chunk and iterate over every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.push(chunk);
        self.frames()
    }

    /// Draining iterator over the frames currently resolvable.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { extractor: self }
    }

    /// Extract the next complete frame, if any.
    ///
    /// Returns `None` when more input is needed. A malformed payload or a
    /// buffer overflow is returned as an error after the offending bytes have
    /// been discarded, so calling again continues with the rest of the stream.
    pub fn next_frame(&mut self) -> Option<Result<DecodedPacket, FrameError>> {
        let Some((start, end)) = self.locate() else {
            return self.check_overflow();
        };

        // Drop noise before the start marker along with the frame itself.
        let frame = self.buffer.split_to(end + END_MARKER.len());
        let body = &frame[start + START_MARKER.len()..end];

        Some(serde_json::from_slice::<DecodedPacket>(body).map_err(|source| {
            FrameError::MalformedPayload {
                span: String::from_utf8_lossy(body).into_owned(),
                source,
            }
        }))
    }

    /// Discard everything buffered.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes retained while waiting for the current frame to close.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Positions of the first start marker and the first end marker that
    /// follows it.
    fn locate(&self) -> Option<(usize, usize)> {
        let start = find(&self.buffer, START_MARKER, 0)?;
        let end = find(&self.buffer, END_MARKER, start + START_MARKER.len())?;
        Some((start, end))
    }

    fn check_overflow(&mut self) -> Option<Result<DecodedPacket, FrameError>> {
        if self.buffer.len() <= self.max_buffer {
            return None;
        }

        // Noise ahead of the open frame does not count toward the limit.
        match find(&self.buffer, START_MARKER, 0) {
            Some(start) => self.buffer.advance(start),
            None => {
                self.keep_marker_tail();
                return None;
            }
        }
        if self.buffer.len() <= self.max_buffer {
            return None;
        }

        // The open frame alone is too large. Resume at the most recent start
        // marker, if there is one past the abandoned frame's.
        let len = self.buffer.len();
        match rfind(&self.buffer, START_MARKER) {
            Some(last) if last > 0 => self.buffer.advance(last),
            _ => self.keep_marker_tail(),
        }
        Some(Err(FrameError::BufferOverflow {
            len,
            max: self.max_buffer,
        }))
    }

    /// Drop everything except a tail that could still be the beginning of a
    /// start marker split across reads.
    fn keep_marker_tail(&mut self) {
        let keep = START_MARKER.len() - 1;
        if self.buffer.len() > keep {
            let excess = self.buffer.len() - keep;
            self.buffer.advance(excess);
        }
    }
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameExtractor::frames`].
pub struct Frames<'a> {
    extractor: &'a mut FrameExtractor,
}

impl Iterator for Frames<'_> {
    type Item = Result<DecodedPacket, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.extractor.next_frame()
    }
}

/// Wrap a JSON value in frame markers, as the producer does.
pub fn encode_frame(payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    let mut frame = Vec::with_capacity(START_MARKER.len() + body.len() + END_MARKER.len());
    frame.extend_from_slice(START_MARKER);
    frame.extend_from_slice(body.as_bytes());
    frame.extend_from_slice(END_MARKER);
    frame
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
