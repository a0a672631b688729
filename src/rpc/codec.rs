//! Frame header codec.
//!
//! Wire format:
//! ```text
//! ┌──────────────────────────────┬────────────────────────────┐
//! │ Header (4B, big-endian u32)  │ Envelope (length B)        │
//! │ [31..28] version             │                            │
//! │ [27..0]  length              │                            │
//! └──────────────────────────────┴────────────────────────────┘
//! ```
//!
//! The length excludes the header itself.

use crate::error::{Error, Result};

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame header size (4 bytes).
pub const HEADER_SIZE: usize = 4;

/// Largest length representable in the 28-bit field.
pub const MAX_HEADER_LENGTH: u32 = 0x0FFF_FFFF;

const VERSION_MASK: u32 = 0xF000_0000;
const LENGTH_MASK: u32 = 0x0FFF_FFFF;
const VERSION_SHIFT: u32 = 28;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Header for the current protocol version.
    pub fn new(length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            length,
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        encode_header(self.version, self.length).to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        let (version, length) = decode_header(u32::from_be_bytes(bytes));
        Self { version, length }
    }

    pub fn is_current_version(self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Pack a version and length into the 32-bit header word.
///
/// Bits above the field widths are discarded.
pub fn encode_header(version: u8, length: u32) -> u32 {
    ((u32::from(version) << VERSION_SHIFT) & VERSION_MASK) | (length & LENGTH_MASK)
}

/// Split a 32-bit header word into `(version, length)`.
pub fn decode_header(word: u32) -> (u8, u32) {
    (((word & VERSION_MASK) >> VERSION_SHIFT) as u8, word & LENGTH_MASK)
}

/// Prefix an encoded envelope with its header.
///
/// Rejects envelopes larger than `max_len` (and, regardless of `max_len`,
/// anything the 28-bit field cannot express).
pub fn encode_frame(envelope: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let cap = max_len.min(MAX_HEADER_LENGTH as usize);
    if envelope.len() > cap {
        return Err(Error::FrameTooLarge {
            len: envelope.len(),
            max: cap,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + envelope.len());
    frame.extend_from_slice(&FrameHeader::new(envelope.len() as u32).to_bytes());
    frame.extend_from_slice(envelope);
    Ok(frame)
}
