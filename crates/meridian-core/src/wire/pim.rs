//! PIM common header (RFC 7761 §4.9). Message bodies are opaque payload.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::checksum::CrcMode;
use crate::chunk::{FieldsChunk, Header};

pub const PIM_HEADER_LENGTH: usize = 4;
pub const PIM_VERSION: u8 = 2;

pub const PIM_HELLO: u8 = 0;
pub const PIM_REGISTER: u8 = 1;
pub const PIM_JOIN_PRUNE: u8 = 3;
pub const PIM_ASSERT: u8 = 5;

/// Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct PimWire {
    version_type: u8,
    reserved: u8,
    checksum: U16<NetworkEndian>,
}

assert_eq_size!(PimWire, [u8; 4]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimHeader {
    pub message_type: u8,
    pub crc: u16,
    pub crc_mode: CrcMode,
}

impl PimHeader {
    pub fn new(message_type: u8) -> Self {
        Self {
            message_type,
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
        }
    }
}

impl FieldsChunk for PimHeader {
    fn chunk_length(&self) -> usize {
        PIM_HEADER_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = PimWire {
            version_type: (PIM_VERSION << 4) | (self.message_type & 0x0f),
            reserved: 0,
            checksum: U16::new(self.crc),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for PimHeader {
    const MIN_LENGTH: usize = PIM_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = PimWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: PIM_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        let version = wire.version_type >> 4;
        if version != PIM_VERSION {
            return Err(WireError::BadVersion {
                expected: PIM_VERSION,
                found: version,
            });
        }
        Ok(PimHeader {
            message_type: wire.version_type & 0x0f,
            crc: wire.checksum.get(),
            crc_mode: CrcMode::from_received(wire.checksum.get()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let h = PimHeader {
            message_type: PIM_JOIN_PRUNE,
            crc: 0x1234,
            crc_mode: CrcMode::Computed,
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.as_ref(), &[0x23, 0, 0x12, 0x34]);
        assert_eq!(PimHeader::deserialize(&bytes).unwrap(), h);
        assert!(PimHeader::deserialize(&[0x13, 0, 0, 0]).is_err());
    }
}
