//! UDP header (RFC 768).

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::checksum::CrcMode;
use crate::chunk::{FieldsChunk, Header};

pub const UDP_HEADER_LENGTH: usize = 8;

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct UdpWire {
    src_port: U16<NetworkEndian>,
    dest_port: U16<NetworkEndian>,
    total_length: U16<NetworkEndian>,
    checksum: U16<NetworkEndian>,
}

assert_eq_size!(UdpWire, [u8; 8]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    /// Header plus payload.
    pub total_length: u16,
    pub crc: u16,
    pub crc_mode: CrcMode,
}

impl Default for UdpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dest_port: 0,
            total_length: UDP_HEADER_LENGTH as u16,
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
        }
    }
}

impl FieldsChunk for UdpHeader {
    fn chunk_length(&self) -> usize {
        UDP_HEADER_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = UdpWire {
            src_port: U16::new(self.src_port),
            dest_port: U16::new(self.dest_port),
            total_length: U16::new(self.total_length),
            checksum: U16::new(self.crc),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for UdpHeader {
    const MIN_LENGTH: usize = UDP_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = UdpWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: UDP_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        Ok(UdpHeader {
            src_port: wire.src_port.get(),
            dest_port: wire.dest_port.get(),
            total_length: wire.total_length.get(),
            crc: wire.checksum.get(),
            crc_mode: CrcMode::from_received(wire.checksum.get()),
        })
    }
}
