//! Ethernet II MAC header and FCS trailer.

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::address::MacAddress;
use crate::checksum::{CrcMode, FCS_DECLARED_CORRECT, FCS_DECLARED_INCORRECT};
use crate::chunk::{FieldsChunk, Header};

pub const ETHERNET_HEADER_LENGTH: usize = 14;
pub const ETHERNET_FCS_LENGTH: usize = 4;
/// Header plus payload plus FCS of a minimum-size frame.
pub const ETHERNET_MIN_FRAME: usize = 64;
pub const ETHERNET_MIN_PAYLOAD: usize =
    ETHERNET_MIN_FRAME - ETHERNET_HEADER_LENGTH - ETHERNET_FCS_LENGTH;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Wire size: 14 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct EthernetWire {
    dest: [u8; 6],
    src: [u8; 6],
    ether_type: U16<NetworkEndian>,
}

assert_eq_size!(EthernetWire, [u8; 14]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetMacHeader {
    pub dest: MacAddress,
    pub src: MacAddress,
    pub ether_type: u16,
}

impl FieldsChunk for EthernetMacHeader {
    fn chunk_length(&self) -> usize {
        ETHERNET_HEADER_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = EthernetWire {
            dest: self.dest.octets(),
            src: self.src.octets(),
            ether_type: U16::new(self.ether_type),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for EthernetMacHeader {
    const MIN_LENGTH: usize = ETHERNET_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = EthernetWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ETHERNET_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        Ok(EthernetMacHeader {
            dest: MacAddress(wire.dest),
            src: MacAddress(wire.src),
            ether_type: wire.ether_type.get(),
        })
    }
}

// ── FCS ───────────────────────────────────────────────────────────────────────

/// Wire size: 4 bytes. The FCS is transmitted least significant byte first.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct FcsWire {
    fcs: U32<zerocopy::byteorder::LittleEndian>,
}

assert_eq_size!(FcsWire, [u8; 4]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFcs {
    pub fcs: u32,
    pub mode: CrcMode,
}

impl EthernetFcs {
    /// Build an FCS for `frame` (header plus payload) in `mode`.
    pub fn for_frame(frame: &[u8], mode: CrcMode) -> Self {
        let fcs = match mode {
            CrcMode::Computed => crc32fast::hash(frame),
            CrcMode::DeclaredCorrect => FCS_DECLARED_CORRECT,
            CrcMode::DeclaredIncorrect => FCS_DECLARED_INCORRECT,
            CrcMode::Disabled => 0,
        };
        Self { fcs, mode }
    }

    /// Check against `frame` according to `mode`.
    pub fn verify(&self, frame: &[u8]) -> bool {
        match self.mode {
            CrcMode::Disabled | CrcMode::DeclaredCorrect => true,
            CrcMode::DeclaredIncorrect => false,
            CrcMode::Computed => crc32fast::hash(frame) == self.fcs,
        }
    }
}

impl FieldsChunk for EthernetFcs {
    fn chunk_length(&self) -> usize {
        ETHERNET_FCS_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = FcsWire {
            fcs: U32::new(self.fcs),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for EthernetFcs {
    const MIN_LENGTH: usize = ETHERNET_FCS_LENGTH;

    /// The mode is recovered from the sentinel values; zero means disabled
    /// and anything else is treated as a computed CRC.
    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = FcsWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ETHERNET_FCS_LENGTH,
            have: bytes.len(),
        })?;
        let fcs = wire.fcs.get();
        let mode = match fcs {
            FCS_DECLARED_CORRECT => CrcMode::DeclaredCorrect,
            FCS_DECLARED_INCORRECT => CrcMode::DeclaredIncorrect,
            0 => CrcMode::Disabled,
            _ => CrcMode::Computed,
        };
        Ok(EthernetFcs { fcs, mode })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_header_round_trip() {
        let h = EthernetMacHeader {
            dest: MacAddress::BROADCAST,
            src: "0a:aa:00:00:00:01".parse().unwrap(),
            ether_type: ETHERTYPE_IPV4,
        };
        let bytes = h.to_bytes();
        assert_eq!(&bytes[12..], &[0x08, 0x00]);
        assert_eq!(EthernetMacHeader::deserialize(&bytes).unwrap(), h);
    }

    #[test]
    fn fcs_modes() {
        let frame = b"some frame bytes";
        let computed = EthernetFcs::for_frame(frame, CrcMode::Computed);
        assert!(computed.verify(frame));
        assert!(!computed.verify(b"some frame bytez"));
        let parsed = EthernetFcs::deserialize(&computed.to_bytes()).unwrap();
        assert_eq!(parsed, computed);

        let declared = EthernetFcs::for_frame(frame, CrcMode::DeclaredCorrect);
        let parsed = EthernetFcs::deserialize(&declared.to_bytes()).unwrap();
        assert_eq!(parsed.mode, CrcMode::DeclaredCorrect);
        assert!(!EthernetFcs::for_frame(frame, CrcMode::DeclaredIncorrect).verify(frame));
    }
}
