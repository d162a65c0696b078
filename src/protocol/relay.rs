//! Relay cell plaintext
//!
//! The logical form of a relay cell before onion encryption or after full
//! decryption and digest verification. The 4-byte digest field is zeroed
//! for digest computation and then overwritten with the head of the
//! running forward digest; the padding bytes participate in that digest,
//! so their generation rule is part of the wire format.

use crate::error::{Result, TorError};
use crate::protocol::codec::{Reader, Writer, FIXED_PAYLOAD_LEN};
use rand::Rng;

/// Header bytes before the data: command, recognized, stream id, digest,
/// length.
pub const RELAY_HEADER_LEN: usize = 11;

/// Largest data slice one relay cell can carry.
pub const MAX_RELAY_DATA_LEN: usize = FIXED_PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Relay-level commands carried inside RELAY / RELAY_EARLY cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// RELAY_END reason sent on clean local close.
pub const END_REASON_DONE: u8 = 6;

/// Decrypted relay-cell payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCellPlain {
    pub command: RelayCommand,

    /// Zero on a cell addressed to the processing hop
    pub recognized: u16,

    /// Zero for circuit-control commands, the stream id otherwise
    pub stream_id: u16,

    /// Head of the running digest for this direction
    pub digest: [u8; 4],

    pub data: Vec<u8>,

    /// Fills the cell to 509 bytes; generated once at construction and
    /// digested along with everything else
    padding: Vec<u8>,
}

impl RelayCellPlain {
    /// Build an outgoing relay cell with fresh padding and a zeroed
    /// digest field.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_RELAY_DATA_LEN {
            return Err(TorError::Internal(format!(
                "Relay data too large: {} bytes, max {}",
                data.len(),
                MAX_RELAY_DATA_LEN
            )));
        }
        let padding = Self::make_padding(MAX_RELAY_DATA_LEN - data.len());
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0u8; 4],
            data,
            padding,
        })
    }

    /// Random non-zero padding with the first up-to-4 bytes forced to
    /// zero, matching the reference padding rule bit-for-bit.
    fn make_padding(len: usize) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut padding: Vec<u8> = (0..len).map(|_| rng.gen_range(1..=255u8)).collect();
        for byte in padding.iter_mut().take(4) {
            *byte = 0;
        }
        padding
    }

    /// Open a stream to `host:port` through the exit.
    pub fn begin(stream_id: u16, host: &str, port: u16) -> Result<Self> {
        let mut data = format!("{}:{}", host, port).into_bytes();
        data.push(0); // null-terminated address
        Self::new(RelayCommand::Begin, stream_id, data)
    }

    /// Open a directory stream to the terminal hop itself.
    pub fn begin_dir(stream_id: u16) -> Result<Self> {
        Self::new(RelayCommand::BeginDir, stream_id, Vec::new())
    }

    pub fn data(stream_id: u16, data: Vec<u8>) -> Result<Self> {
        Self::new(RelayCommand::Data, stream_id, data)
    }

    pub fn end(stream_id: u16, reason: u8) -> Result<Self> {
        Self::new(RelayCommand::End, stream_id, vec![reason])
    }

    /// Stream-level SENDME (circuit-level uses stream id 0).
    pub fn sendme(stream_id: u16) -> Result<Self> {
        Self::new(RelayCommand::Sendme, stream_id, Vec::new())
    }

    /// Whether this layer's decrypt produced a cell addressed to us.
    pub fn is_recognized(&self) -> bool {
        self.recognized == 0
    }

    /// Serialize to the fixed 509-byte form. With `zero_digest` the digest
    /// field is written as four zero bytes, which is the form the running
    /// digests consume.
    pub fn encode(&self, zero_digest: bool) -> Vec<u8> {
        let mut writer = Writer::with_capacity(FIXED_PAYLOAD_LEN);
        writer.write_u8(self.command as u8);
        writer.write_u16(self.recognized);
        writer.write_u16(self.stream_id);
        if zero_digest {
            writer.write_bytes(&[0u8; 4]);
        } else {
            writer.write_bytes(&self.digest);
        }
        writer.write_u16(self.data.len() as u16);
        writer.write_bytes(&self.data);
        writer.write_bytes(&self.padding);
        debug_assert_eq!(writer.len(), FIXED_PAYLOAD_LEN);
        writer.into_bytes()
    }

    /// Parse a fully decrypted 509-byte relay payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != FIXED_PAYLOAD_LEN {
            return Err(TorError::Protocol(format!(
                "Relay payload must be {} bytes, got {}",
                FIXED_PAYLOAD_LEN,
                payload.len()
            )));
        }
        let mut reader = Reader::new(payload);
        let command_byte = reader.read_u8()?;
        let command = RelayCommand::from_u8(command_byte).ok_or_else(|| {
            TorError::Protocol(format!("Unknown relay command: {}", command_byte))
        })?;
        let recognized = reader.read_u16()?;
        let stream_id = reader.read_u16()?;
        let digest = reader.read_array()?;
        let length = reader.read_u16()? as usize;
        if length > MAX_RELAY_DATA_LEN {
            return Err(TorError::Protocol(format!(
                "Relay data length {} exceeds cell capacity",
                length
            )));
        }
        let data = reader.read_bytes(length)?;
        let padding = reader.read_to_end();
        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data,
            padding,
        })
    }
}
