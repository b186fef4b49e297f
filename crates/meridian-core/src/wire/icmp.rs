//! ICMP (RFC 792) and ICMPv6 (RFC 4443) headers.
//!
//! Both share one 8-byte layout: type, code, checksum, and four bytes whose
//! meaning depends on the type (identifier and sequence for echo, next-hop
//! MTU for too-big, pointer for parameter problem).

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::checksum::CrcMode;
use crate::chunk::{FieldsChunk, Header};

pub const ICMP_HEADER_LENGTH: usize = 8;

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct IcmpWire {
    icmp_type: u8,
    code: u8,
    checksum: U16<NetworkEndian>,
    rest: [u8; 4],
}

assert_eq_size!(IcmpWire, [u8; 8]);

// ── ICMPv4 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    Redirect = 5,
    EchoRequest = 8,
    TimeExceeded = 11,
    ParameterProblem = 12,
}

impl IcmpType {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            IcmpType::DestinationUnreachable
                | IcmpType::Redirect
                | IcmpType::TimeExceeded
                | IcmpType::ParameterProblem
        )
    }
}

impl TryFrom<u8> for IcmpType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IcmpType::EchoReply),
            3 => Ok(IcmpType::DestinationUnreachable),
            5 => Ok(IcmpType::Redirect),
            8 => Ok(IcmpType::EchoRequest),
            11 => Ok(IcmpType::TimeExceeded),
            12 => Ok(IcmpType::ParameterProblem),
            other => Err(WireError::UnknownType {
                what: "icmp",
                value: other,
            }),
        }
    }
}

impl From<IcmpType> for u8 {
    fn from(t: IcmpType) -> u8 {
        t as u8
    }
}

/// Destination-unreachable codes.
pub mod unreachable {
    pub const NET: u8 = 0;
    pub const HOST: u8 = 1;
    pub const PROTOCOL: u8 = 2;
    pub const PORT: u8 = 3;
    pub const FRAGMENTATION_NEEDED: u8 = 4;
}

/// Time-exceeded codes.
pub mod time_exceeded {
    pub const TTL_ZERO_DURING_TRANSIT: u8 = 0;
    pub const REASSEMBLY_TIMEOUT: u8 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: IcmpType,
    pub code: u8,
    pub crc: u16,
    pub crc_mode: CrcMode,
    pub rest: [u8; 4],
}

impl IcmpHeader {
    pub fn new(icmp_type: IcmpType, code: u8) -> Self {
        Self {
            icmp_type,
            code,
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
            rest: [0; 4],
        }
    }

    pub fn echo(icmp_type: IcmpType, identifier: u16, sequence: u16) -> Self {
        let mut h = Self::new(icmp_type, 0);
        h.rest[..2].copy_from_slice(&identifier.to_be_bytes());
        h.rest[2..].copy_from_slice(&sequence.to_be_bytes());
        h
    }

    /// Next-hop MTU carried by fragmentation-needed (RFC 1191).
    pub fn set_next_hop_mtu(&mut self, mtu: u16) {
        self.rest[2..].copy_from_slice(&mtu.to_be_bytes());
    }

    pub fn next_hop_mtu(&self) -> u16 {
        u16::from_be_bytes([self.rest[2], self.rest[3]])
    }

    pub fn set_pointer(&mut self, pointer: u8) {
        self.rest[0] = pointer;
    }
}

impl FieldsChunk for IcmpHeader {
    fn chunk_length(&self) -> usize {
        ICMP_HEADER_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = IcmpWire {
            icmp_type: self.icmp_type.into(),
            code: self.code,
            checksum: U16::new(self.crc),
            rest: self.rest,
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for IcmpHeader {
    const MIN_LENGTH: usize = ICMP_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = IcmpWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ICMP_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        Ok(IcmpHeader {
            icmp_type: IcmpType::try_from(wire.icmp_type)?,
            code: wire.code,
            crc: wire.checksum.get(),
            crc_mode: CrcMode::from_received(wire.checksum.get()),
            rest: wire.rest,
        })
    }
}

// ── ICMPv6 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Icmpv6Type {
    DestinationUnreachable = 1,
    PacketTooBig = 2,
    TimeExceeded = 3,
    ParameterProblem = 4,
    EchoRequest = 128,
    EchoReply = 129,
    RouterSolicitation = 133,
    RouterAdvertisement = 134,
    NeighbourSolicitation = 135,
    NeighbourAdvertisement = 136,
    Redirect = 137,
}

impl Icmpv6Type {
    pub fn is_error(self) -> bool {
        (self as u8) < 128
    }

    /// Types handled by Neighbour Discovery rather than ICMPv6 proper.
    pub fn is_neighbour_discovery(self) -> bool {
        matches!(self as u8, 133..=137)
    }
}

impl TryFrom<u8> for Icmpv6Type {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Icmpv6Type::DestinationUnreachable),
            2 => Ok(Icmpv6Type::PacketTooBig),
            3 => Ok(Icmpv6Type::TimeExceeded),
            4 => Ok(Icmpv6Type::ParameterProblem),
            128 => Ok(Icmpv6Type::EchoRequest),
            129 => Ok(Icmpv6Type::EchoReply),
            133 => Ok(Icmpv6Type::RouterSolicitation),
            134 => Ok(Icmpv6Type::RouterAdvertisement),
            135 => Ok(Icmpv6Type::NeighbourSolicitation),
            136 => Ok(Icmpv6Type::NeighbourAdvertisement),
            137 => Ok(Icmpv6Type::Redirect),
            other => Err(WireError::UnknownType {
                what: "icmpv6",
                value: other,
            }),
        }
    }
}

impl From<Icmpv6Type> for u8 {
    fn from(t: Icmpv6Type) -> u8 {
        t as u8
    }
}

pub mod unreachable_v6 {
    pub const NO_ROUTE: u8 = 0;
    pub const ADMINISTRATIVELY_PROHIBITED: u8 = 1;
    pub const ADDRESS_UNREACHABLE: u8 = 3;
    pub const PORT_UNREACHABLE: u8 = 4;
}

pub mod parameter_problem_v6 {
    pub const ERRONEOUS_HEADER_FIELD: u8 = 0;
    pub const UNRECOGNIZED_NEXT_HEADER: u8 = 1;
    pub const UNRECOGNIZED_OPTION: u8 = 2;
}

pub mod time_exceeded_v6 {
    pub const HOP_LIMIT_EXCEEDED: u8 = 0;
    pub const REASSEMBLY_TIMEOUT: u8 = 1;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv6Header {
    pub icmp_type: Icmpv6Type,
    pub code: u8,
    pub crc: u16,
    pub crc_mode: CrcMode,
    pub rest: [u8; 4],
}

impl Icmpv6Header {
    pub fn new(icmp_type: Icmpv6Type, code: u8) -> Self {
        Self {
            icmp_type,
            code,
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
            rest: [0; 4],
        }
    }

    pub fn echo(icmp_type: Icmpv6Type, identifier: u16, sequence: u16) -> Self {
        let mut h = Self::new(icmp_type, 0);
        h.rest[..2].copy_from_slice(&identifier.to_be_bytes());
        h.rest[2..].copy_from_slice(&sequence.to_be_bytes());
        h
    }

    /// MTU for packet-too-big, pointer for parameter-problem.
    pub fn set_value(&mut self, value: u32) {
        self.rest = value.to_be_bytes();
    }

    pub fn value(&self) -> u32 {
        u32::from_be_bytes(self.rest)
    }
}

impl FieldsChunk for Icmpv6Header {
    fn chunk_length(&self) -> usize {
        ICMP_HEADER_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = IcmpWire {
            icmp_type: self.icmp_type.into(),
            code: self.code,
            checksum: U16::new(self.crc),
            rest: self.rest,
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for Icmpv6Header {
    const MIN_LENGTH: usize = ICMP_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = IcmpWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ICMP_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        Ok(Icmpv6Header {
            icmp_type: Icmpv6Type::try_from(wire.icmp_type)?,
            code: wire.code,
            crc: wire.checksum.get(),
            crc_mode: CrcMode::from_received(wire.checksum.get()),
            rest: wire.rest,
        })
    }
}
