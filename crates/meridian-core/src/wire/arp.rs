//! ARP packet for IPv4 over Ethernet (RFC 826).

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::address::MacAddress;
use crate::chunk::{FieldsChunk, Header};

pub const ARP_PACKET_LENGTH: usize = 28;

/// Wire size: 28 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct ArpWire {
    hardware_type: U16<NetworkEndian>,
    protocol_type: U16<NetworkEndian>,
    hardware_length: u8,
    protocol_length: u8,
    opcode: U16<NetworkEndian>,
    sender_mac: [u8; 6],
    sender_ip: [u8; 4],
    target_mac: [u8; 6],
    target_ip: [u8; 4],
}

assert_eq_size!(ArpWire, [u8; 28]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOpcode {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOpcode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ArpOpcode::Request),
            2 => Ok(ArpOpcode::Reply),
            other => Err(WireError::UnknownType {
                what: "arp opcode",
                value: other as u8,
            }),
        }
    }
}

impl From<ArpOpcode> for u16 {
    fn from(op: ArpOpcode) -> u16 {
        op as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: ArpOpcode,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

impl FieldsChunk for ArpPacket {
    fn chunk_length(&self) -> usize {
        ARP_PACKET_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = ArpWire {
            hardware_type: U16::new(1),
            protocol_type: U16::new(0x0800),
            hardware_length: 6,
            protocol_length: 4,
            opcode: U16::new(self.opcode.into()),
            sender_mac: self.sender_mac.octets(),
            sender_ip: self.sender_ip.octets(),
            target_mac: self.target_mac.octets(),
            target_ip: self.target_ip.octets(),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for ArpPacket {
    const MIN_LENGTH: usize = ARP_PACKET_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = ArpWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ARP_PACKET_LENGTH,
            have: bytes.len(),
        })?;
        if wire.hardware_length != 6 || wire.protocol_length != 4 {
            return Err(WireError::BadLength {
                what: "arp address length",
                value: usize::from(wire.hardware_length),
            });
        }
        Ok(ArpPacket {
            opcode: ArpOpcode::try_from(wire.opcode.get())?,
            sender_mac: MacAddress(wire.sender_mac),
            sender_ip: Ipv4Addr::from(wire.sender_ip),
            target_mac: MacAddress(wire.target_mac),
            target_ip: Ipv4Addr::from(wire.target_ip),
        })
    }
}
