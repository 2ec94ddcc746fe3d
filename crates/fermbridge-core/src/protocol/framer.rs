//! Line framing
//!
//! Splits the raw serial byte stream into newline-terminated response lines.
//! Partial lines are kept across reads, so a line split over several reads
//! comes out whole. A trailing `\r` is stripped and blank lines are skipped.
//!
//! A line that grows past `max_length` without a delimiter is dropped: the
//! framer yields [`FramedLine::TooLong`] once, then discards input up to and
//! including the next `\n`. Overflow is reported as an item rather than a
//! decoder error because an error ends a `FramedRead` stream.

use bytes::{Buf, Bytes, BytesMut};
use std::borrow::Cow;
use std::io;
use tokio_util::codec::Decoder;

use super::MAX_LINE_LENGTH;

/// One complete line from the controller, without its delimiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Bytes,
}

impl RawFrame {
    /// Wrap already-delimited bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw line bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Line text; invalid UTF-8 is replaced rather than rejected
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Number of bytes in the line
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length line
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Output of the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedLine {
    /// A complete line
    Line(RawFrame),
    /// The buffer overflowed; `discarded` bytes were thrown away
    TooLong { discarded: usize },
}

/// Newline framer with a bounded partial-line buffer
#[derive(Debug, Clone)]
pub struct LineFramer {
    max_length: usize,
    /// Index up to which the buffer has already been searched for `\n`
    next_index: usize,
    /// Dropping bytes until the next delimiter after an overflow
    discarding: bool,
}

impl LineFramer {
    /// Create a framer with the default maximum line length
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    /// Create a framer that accepts lines of at most `max_length` bytes
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
            next_index: 0,
            discarding: false,
        }
    }

    /// Maximum accepted line length
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Forget any partial-line state (used when a transport is reopened)
    pub fn reset(&mut self) {
        self.next_index = 0;
        self.discarding = false;
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFramer {
    type Item = FramedLine;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FramedLine>, io::Error> {
        loop {
            if self.discarding {
                match buf.iter().position(|b| *b == b'\n') {
                    Some(offset) => {
                        buf.advance(offset + 1);
                        self.discarding = false;
                        self.next_index = 0;
                        continue;
                    }
                    None => {
                        buf.clear();
                        return Ok(None);
                    }
                }
            }

            let read_to = buf.len().min(self.max_length + 1);
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match newline {
                Some(offset) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    return Ok(Some(FramedLine::Line(RawFrame::new(line.freeze()))));
                }
                None if buf.len() > self.max_length => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(Some(FramedLine::TooLong {
                        discarded: read_to,
                    }));
                }
                None => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<FramedLine>, io::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // An unterminated tail at EOF is never a complete response
                buf.clear();
                self.reset();
                Ok(None)
            }
        }
    }
}
