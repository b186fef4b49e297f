//! TCP header framing (RFC 9293). Only the header and its checksum are
//! handled here; connection state lives elsewhere.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::{require, WireError};
use crate::checksum::CrcMode;
use crate::chunk::{FieldsChunk, Header};

pub const TCP_MIN_HEADER_LENGTH: usize = 20;
pub const TCP_MAX_HEADER_LENGTH: usize = 60;

pub const FLAG_FIN: u16 = 0x001;
pub const FLAG_SYN: u16 = 0x002;
pub const FLAG_RST: u16 = 0x004;
pub const FLAG_PSH: u16 = 0x008;
pub const FLAG_ACK: u16 = 0x010;
pub const FLAG_URG: u16 = 0x020;
pub const FLAG_ECE: u16 = 0x040;
pub const FLAG_CWR: u16 = 0x080;

/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct TcpFixedWire {
    src_port: U16<NetworkEndian>,
    dest_port: U16<NetworkEndian>,
    sequence: U32<NetworkEndian>,
    acknowledgement: U32<NetworkEndian>,
    offset_flags: U16<NetworkEndian>,
    window: U16<NetworkEndian>,
    checksum: U16<NetworkEndian>,
    urgent_pointer: U16<NetworkEndian>,
}

assert_eq_size!(TcpFixedWire, [u8; 20]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dest_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    /// Control bits, see the `FLAG_*` constants.
    pub flags: u16,
    pub window: u16,
    pub urgent_pointer: u16,
    /// Raw option bytes; padded to a 4-byte boundary on the wire.
    pub options: Vec<u8>,
    pub crc: u16,
    pub crc_mode: CrcMode,
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            src_port: 0,
            dest_port: 0,
            sequence: 0,
            acknowledgement: 0,
            flags: 0,
            window: 0,
            urgent_pointer: 0,
            options: Vec::new(),
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
        }
    }
}

impl TcpHeader {
    pub fn header_length(&self) -> usize {
        TCP_MIN_HEADER_LENGTH + (self.options.len() + 3) / 4 * 4
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

impl FieldsChunk for TcpHeader {
    fn chunk_length(&self) -> usize {
        self.header_length()
    }

    fn serialize(&self, out: &mut BytesMut) {
        let header_length = self.header_length();
        let data_offset = (header_length / 4) as u16;
        let wire = TcpFixedWire {
            src_port: U16::new(self.src_port),
            dest_port: U16::new(self.dest_port),
            sequence: U32::new(self.sequence),
            acknowledgement: U32::new(self.acknowledgement),
            offset_flags: U16::new((data_offset << 12) | (self.flags & 0x01ff)),
            window: U16::new(self.window),
            checksum: U16::new(self.crc),
            urgent_pointer: U16::new(self.urgent_pointer),
        };
        out.put_slice(wire.as_bytes());
        out.put_slice(&self.options);
        out.put_bytes(0, header_length - TCP_MIN_HEADER_LENGTH - self.options.len());
    }
}

impl Header for TcpHeader {
    const MIN_LENGTH: usize = TCP_MIN_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = TcpFixedWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: TCP_MIN_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        let offset_flags = wire.offset_flags.get();
        let header_length = usize::from(offset_flags >> 12) * 4;
        if header_length < TCP_MIN_HEADER_LENGTH {
            return Err(WireError::BadLength {
                what: "tcp data offset",
                value: header_length,
            });
        }
        require(bytes, header_length)?;
        Ok(TcpHeader {
            src_port: wire.src_port.get(),
            dest_port: wire.dest_port.get(),
            sequence: wire.sequence.get(),
            acknowledgement: wire.acknowledgement.get(),
            flags: offset_flags & 0x01ff,
            window: wire.window.get(),
            urgent_pointer: wire.urgent_pointer.get(),
            options: bytes[TCP_MIN_HEADER_LENGTH..header_length].to_vec(),
            crc: wire.checksum.get(),
            crc_mode: CrcMode::from_received(wire.checksum.get()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_with_options() {
        let h = TcpHeader {
            src_port: 40000,
            dest_port: 80,
            sequence: 0xdead_beef,
            acknowledgement: 7,
            flags: FLAG_SYN | FLAG_ACK,
            window: 65535,
            options: vec![2, 4, 0x05, 0xb4],
            crc_mode: CrcMode::Computed,
            ..TcpHeader::default()
        };
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(bytes[12] >> 4, 6);
        let parsed = TcpHeader::deserialize(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert!(parsed.has_flag(FLAG_SYN));
        assert!(!parsed.has_flag(FLAG_FIN));
    }

    #[test]
    fn rejects_short_data_offset() {
        let mut bytes = TcpHeader::default().to_bytes().to_vec();
        bytes[12] = 0x40;
        assert!(matches!(
            TcpHeader::deserialize(&bytes),
            Err(WireError::BadLength { value: 16, .. })
        ));
    }
}
