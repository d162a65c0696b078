//! Wire codec primitives
//!
//! Two layers live here:
//! - big-endian cursor helpers used by every cell (de)serializer,
//! - the frame codec that splits the raw byte stream into
//!   `(circuit_id, command, payload)` frames.
//!
//! Frame decoding never partially consumes: either a complete frame is
//! buffered and returned, or the input is left untouched until more bytes
//! arrive.

use crate::error::{Result, TorError};

/// Payload size of every fixed-length cell.
pub const FIXED_PAYLOAD_LEN: usize = 509;

/// Big-endian reader over a byte slice.
///
/// All reads fail with a `Protocol` error on truncation; cell decoders use
/// this to consume exactly the bytes their format defines.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.remaining() < len {
            return Err(TorError::Protocol(format!(
                "Truncated payload: need {} more bytes, have {}",
                len,
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.need(len)?;
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    /// Consume whatever is left. Used by decoders whose last field runs to
    /// the end of the payload.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let bytes = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        bytes
    }
}

/// Big-endian writer backed by a `Vec<u8>`.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Zero-pad up to `len` bytes. No-op when already at or past it.
    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// A raw link-layer frame: circuit id, command byte and payload.
///
/// Link protocol v3 framing: 2-byte circuit id, 1-byte command, then either
/// exactly 509 payload bytes (fixed-length commands) or a u16 length prefix
/// followed by that many bytes (VERSIONS and every command >= 128).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorFrame {
    /// Circuit id; 0 is reserved for connection-level control cells
    pub circuit_id: u16,

    /// Command byte
    pub command: u8,

    /// Payload, exactly 509 bytes for fixed-length commands
    pub payload: Vec<u8>,
}

impl TorFrame {
    /// Whether a command uses the u16-length-prefixed variable form.
    pub fn is_variable_length(command: u8) -> bool {
        command == 7 || command >= 128
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None`
    /// when the buffer does not yet hold a complete frame. The buffer is
    /// never partially consumed; truncation is "wait for more data", not
    /// an error.
    pub fn decode(buf: &[u8]) -> Option<(TorFrame, usize)> {
        // circuit id + command
        if buf.len() < 3 {
            return None;
        }
        let circuit_id = u16::from_be_bytes([buf[0], buf[1]]);
        let command = buf[2];

        let (payload_start, length) = if Self::is_variable_length(command) {
            if buf.len() < 5 {
                return None;
            }
            (5, u16::from_be_bytes([buf[3], buf[4]]) as usize)
        } else {
            (3, FIXED_PAYLOAD_LEN)
        };

        if buf.len() < payload_start + length {
            return None;
        }

        let payload = buf[payload_start..payload_start + length].to_vec();
        Some((
            TorFrame {
                circuit_id,
                command,
                payload,
            },
            payload_start + length,
        ))
    }

    /// Append the encoded frame to `out`. Exact inverse of [`decode`].
    ///
    /// Fixed-length payloads must already be padded to 509 bytes; the cell
    /// codec guarantees that before framing.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.circuit_id.to_be_bytes());
        out.push(self.command);
        if Self::is_variable_length(self.command) {
            out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        } else {
            debug_assert_eq!(self.payload.len(), FIXED_PAYLOAD_LEN);
        }
        out.extend_from_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        self.encode_into(&mut out);
        out
    }
}

/// Accumulates transport reads and yields complete frames in order.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read transport bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<TorFrame> {
        let (frame, consumed) = TorFrame::decode(&self.buf)?;
        self.buf.drain(..consumed);
        Some(frame)
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
