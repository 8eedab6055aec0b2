//! Fixed-size frame header.
//!
//! ```text
//! magic           [u8; 4]  "PMX1"
//! kind            u16      message discriminator
//! flags           u16      ProtocolFlags
//! correlation_id  [u8; 16] UUID bytes (nil for pushes)
//! payload_length  u32
//! checksum        u32      blake3(payload)[0..4], 0 when empty
//! ```
//!
//! All integers are little-endian.

use crate::error::PmxError;
use crate::flags::ProtocolFlags;
use crate::message::CorrelationId;

/// Magic bytes opening every frame.
pub const MAGIC: [u8; 4] = *b"PMX1";

/// Encoded header size on the wire.
pub const HEADER_SIZE: usize = 32;

/// Largest payload a single frame may carry (4 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

pub type FrameHeaderBytes = [u8; HEADER_SIZE];

/// Header preceding every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u16,
    pub flags: ProtocolFlags,
    pub correlation_id: CorrelationId,
    pub payload_length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Build a header for `payload`, computing its checksum.
    pub fn for_payload(
        kind: u16,
        flags: ProtocolFlags,
        correlation_id: CorrelationId,
        payload: &[u8],
    ) -> Result<Self, PmxError> {
        if payload.len() > crate::MAX_PAYLOAD_SIZE {
            return Err(PmxError::PayloadTooLarge {
                size: payload.len(),
                max: crate::MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            kind,
            flags,
            correlation_id,
            payload_length: payload.len() as u32,
            checksum: checksum(payload),
        })
    }

    pub fn to_bytes(&self) -> FrameHeaderBytes {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&self.kind.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..24].copy_from_slice(self.correlation_id.as_bytes());
        buf[24..28].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: &FrameHeaderBytes) -> Result<Self, PmxError> {
        if bytes[0..4] != MAGIC {
            return Err(PmxError::Protocol("invalid magic bytes".into()));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[8..24]);
        Ok(Self {
            kind: u16::from_le_bytes([bytes[4], bytes[5]]),
            flags: ProtocolFlags::from_bits_retain(u16::from_le_bytes([bytes[6], bytes[7]])),
            correlation_id: CorrelationId::from_bytes(id),
            payload_length: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            checksum: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
        })
    }

    /// Check `payload` against the header checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<(), PmxError> {
        if checksum(payload) != self.checksum {
            return Err(PmxError::Protocol(format!(
                "checksum mismatch on {} byte payload",
                payload.len()
            )));
        }
        Ok(())
    }
}

/// First four bytes of the blake3 digest, or 0 for an empty payload.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let digest = blake3::hash(payload);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
