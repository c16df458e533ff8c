//! Binary frame codec.
//!
//! ## Frame Format
//!
//! ```text
//! +-------+-----------------------------------------------+------+
//! | START |              escaped payload                  | STOP |
//! +-------+---------------+----------------+--------------+------+
//! | 0x12  | header (4)    | data (N)       | fletcher16   | 0x13 |
//! +-------+---------------+----------------+--------------+------+
//! ```
//!
//! Any START, STOP or ESCAPE byte inside the payload is sent as ESCAPE
//! followed by the byte XORed with `0x80`.
//!
//! Decoding is incremental: bytes can be pushed in any chunking and complete
//! frames come out as soon as their STOP marker arrives. Frames with a wrong
//! length or checksum are dropped and the decoder resynchronises on the next
//! START marker.

use log::trace;

use crate::error::{Error, Result};
use crate::protocol::checksum::{CHECKSUM_LEN, fletcher16};
use crate::protocol::command::CommandWord;

/// Start of frame marker.
pub const START: u8 = 0x12;

/// End of frame marker.
pub const STOP: u8 = 0x13;

/// Escape marker.
pub const ESCAPE: u8 = 0x7D;

/// Mask XORed onto an escaped byte.
pub const ESCAPE_XOR: u8 = 0x80;

/// Header plus checksum bytes around the data of every frame.
pub const FRAME_OVERHEAD: usize = CommandWord::LEN + CHECKSUM_LEN;

#[inline]
fn needs_escape(byte: u8) -> bool {
    matches!(byte, START | STOP | ESCAPE)
}

/// Byte-stuff `payload` and wrap it in START/STOP markers.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    out.push(START);
    for &byte in payload {
        if needs_escape(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out.push(STOP);
    out
}

/// Build a complete wire frame for `command` carrying `data`.
///
/// The header's data length is replaced by `data.len()`.
pub fn encode_frame(command: CommandWord, data: &[u8]) -> Result<Vec<u8>> {
    let data_length = u16::try_from(data.len()).map_err(|_| {
        Error::Protocol(format!("frame data too long: {} bytes", data.len()))
    })?;

    let mut payload = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    payload.extend_from_slice(&command.with_data_length(data_length).encode());
    payload.extend_from_slice(data);
    let checksum = fletcher16(&payload);
    payload.extend_from_slice(&checksum);

    Ok(escape(&payload))
}

/// A decoded, checksum-verified frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command header.
    pub command: CommandWord,
    /// Frame data without header and checksum.
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame, fixing up the header's data length.
    pub fn new(command: CommandWord, data: Vec<u8>) -> Self {
        let data_length = u16::try_from(data.len()).unwrap_or(u16::MAX);
        Self {
            command: command.with_data_length(data_length),
            data,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(self.command, &self.data)
    }
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    waiting_on_start: bool,
    escaped: bool,
    buffer: Vec<u8>,
    dropped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder waiting for a START marker.
    pub fn new() -> Self {
        Self {
            waiting_on_start: true,
            escaped: false,
            buffer: Vec::with_capacity(64),
            dropped: 0,
        }
    }

    /// Number of frames dropped because of a bad length or checksum.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget any partially received frame.
    pub fn reset(&mut self) {
        self.waiting_on_start = true;
        self.escaped = false;
        self.buffer.clear();
    }

    /// Feed received bytes and collect every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Feed one byte, returning a frame if it was the closing STOP.
    pub fn push_byte(&mut self, byte: u8) -> Option<Frame> {
        if self.waiting_on_start && byte != START {
            return None;
        }

        match byte {
            START => {
                self.buffer.clear();
                self.escaped = false;
                self.waiting_on_start = false;
                None
            }
            ESCAPE => {
                self.escaped = true;
                None
            }
            STOP => {
                let frame = self.take_frame();
                if frame.is_none() {
                    self.dropped += 1;
                    trace!("Dropped malformed frame ({} bytes)", self.buffer.len());
                }
                self.reset();
                frame
            }
            _ => {
                if self.escaped {
                    self.escaped = false;
                    self.buffer.push(byte ^ ESCAPE_XOR);
                } else {
                    self.buffer.push(byte);
                }
                None
            }
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < FRAME_OVERHEAD {
            return None;
        }

        let command = CommandWord::decode(&self.buffer[..CommandWord::LEN])?;
        let body_len = usize::from(command.data_length) + CommandWord::LEN;
        if body_len + CHECKSUM_LEN != self.buffer.len() {
            return None;
        }

        if fletcher16(&self.buffer[..body_len]) != self.buffer[body_len..] {
            return None;
        }

        let data = self.buffer[CommandWord::LEN..body_len].to_vec();
        Some(Frame { command, data })
    }
}
