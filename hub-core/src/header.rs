//! Fixed-size envelope header.
//!
//! Every packet on the wire is wrapped in an envelope:
//!
//! ```text
//! ┌────────────┬────────────────┬────────────┬─────────────────────┐
//! │ magic (4)  │ payload_len(4) │ checksum(4)│ payload (bincode)   │
//! └────────────┴────────────────┴────────────┴─────────────────────┘
//! ```
//!
//! All integers are little-endian. `checksum` holds the first four bytes
//! of the BLAKE3 hash of the payload. The magic value plus a bounded
//! length is what the resynchronization scan looks for.

use crate::error::HubError;

/// Magic bytes that open every envelope.
pub const MAGIC: [u8; 4] = *b"HUB1";

/// Size of the envelope header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest payload an envelope may declare (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

pub type HeaderBytes = [u8; HEADER_SIZE];

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    payload_length: u32,
    checksum: u32,
}

impl EnvelopeHeader {
    /// Build the header for `payload`, computing its checksum.
    pub fn for_payload(payload: &[u8]) -> Result<Self, HubError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HubError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            payload_length: payload.len() as u32,
            checksum: payload_checksum(payload),
        })
    }

    pub fn to_bytes(&self) -> HeaderBytes {
        let mut bytes: HeaderBytes = [0; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&MAGIC);
        bytes[4..8].copy_from_slice(&self.payload_length.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HubError> {
        if bytes.len() < HEADER_SIZE {
            return Err(HubError::InvalidHeader("shorter than header size"));
        }
        if bytes[0..4] != MAGIC {
            return Err(HubError::InvalidMagic);
        }
        let payload_length = read_u32(&bytes[4..8]);
        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(HubError::PayloadTooLarge {
                size: payload_length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            payload_length,
            checksum: read_u32(&bytes[8..12]),
        })
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length as usize
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Header plus payload length: how far a reader advances past this envelope.
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload_length()
    }

    /// Returns `true` if `payload` hashes to the stored checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.payload_length() && payload_checksum(payload) == self.checksum
    }
}

impl std::fmt::Debug for EnvelopeHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeHeader")
            .field("payload_length", &self.payload_length)
            .field("checksum", &format_args!("{:#010x}", self.checksum))
            .finish()
    }
}

/// Heuristic used during resynchronization: does an envelope plausibly
/// begin at offset 0 of `bytes`?
///
/// Requires at least [`HEADER_SIZE`] bytes; shorter input never looks
/// like a header.
pub fn looks_like_header(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_SIZE
        && bytes[0..4] == MAGIC
        && read_u32(&bytes[4..8]) as usize <= MAX_PAYLOAD_SIZE
}

/// `true` iff `bytes` holds a header and the full payload it declares.
pub fn has_complete_envelope(bytes: &[u8]) -> bool {
    match EnvelopeHeader::from_bytes(bytes) {
        Ok(header) => bytes.len() >= header.total_size(),
        Err(_) => false,
    }
}

fn payload_checksum(payload: &[u8]) -> u32 {
    let hash = blake3::hash(payload);
    let bytes = hash.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
