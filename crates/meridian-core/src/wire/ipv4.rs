//! IPv4 header (RFC 791) with options.

use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::{require, WireError};
use crate::checksum::{internet_checksum, CrcMode};
use crate::chunk::{FieldsChunk, Header};

pub const IPV4_MIN_HEADER_LENGTH: usize = 20;
pub const IPV4_MAX_HEADER_LENGTH: usize = 60;

const FLAG_RESERVED: u16 = 0x8000;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FRAGMENT_OFFSET_MASK: u16 = 0x1fff;

// ── Fixed part ────────────────────────────────────────────────────────────────

/// Wire size: 20 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct Ipv4FixedWire {
    version_ihl: u8,
    tos: u8,
    total_length: U16<NetworkEndian>,
    identification: U16<NetworkEndian>,
    flags_fragment: U16<NetworkEndian>,
    ttl: u8,
    protocol: u8,
    checksum: U16<NetworkEndian>,
    src: [u8; 4],
    dest: [u8; 4],
}

assert_eq_size!(Ipv4FixedWire, [u8; 20]);

// ── Options ───────────────────────────────────────────────────────────────────

pub const OPTION_END: u8 = 0;
pub const OPTION_NOP: u8 = 1;
pub const OPTION_RECORD_ROUTE: u8 = 7;
pub const OPTION_TIMESTAMP: u8 = 68;
pub const OPTION_ROUTER_ALERT: u8 = 148;

/// One IPv4 option. `End` and `Nop` are single bytes; every other kind is
/// type-length-value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Option {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl Ipv4Option {
    pub fn nop() -> Self {
        Self {
            kind: OPTION_NOP,
            data: Vec::new(),
        }
    }

    /// Router alert (RFC 2113), value 0.
    pub fn router_alert() -> Self {
        Self {
            kind: OPTION_ROUTER_ALERT,
            data: vec![0, 0],
        }
    }

    /// Record route with room for `slots` addresses.
    pub fn record_route(slots: usize) -> Self {
        let mut data = vec![4u8];
        data.resize(1 + slots * 4, 0);
        Self {
            kind: OPTION_RECORD_ROUTE,
            data,
        }
    }

    /// Options with the copy bit set are repeated in every fragment.
    pub fn is_copied(&self) -> bool {
        self.kind & 0x80 != 0
    }

    pub fn length(&self) -> usize {
        match self.kind {
            OPTION_END | OPTION_NOP => 1,
            _ => 2 + self.data.len(),
        }
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.kind);
        if self.length() > 1 {
            out.put_u8(self.length() as u8);
            out.put_slice(&self.data);
        }
    }
}

fn parse_options(mut bytes: &[u8]) -> Result<Vec<Ipv4Option>, WireError> {
    let mut options = Vec::new();
    while let Some((&kind, rest)) = bytes.split_first() {
        match kind {
            OPTION_END => break,
            OPTION_NOP => {
                options.push(Ipv4Option::nop());
                bytes = rest;
            }
            _ => {
                let len = *rest.first().ok_or(WireError::BadOption(kind))? as usize;
                if len < 2 || len > bytes.len() {
                    return Err(WireError::BadOption(kind));
                }
                options.push(Ipv4Option {
                    kind,
                    data: bytes[2..len].to_vec(),
                });
                bytes = &bytes[len..];
            }
        }
    }
    Ok(options)
}

// ── Header ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Type-of-service byte: DSCP in the high six bits, ECN in the low two.
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub reserved_bit: bool,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// In bytes; always a multiple of 8 on the wire.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub crc: u16,
    pub crc_mode: CrcMode,
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub options: Vec<Ipv4Option>,
}

impl Default for Ipv4Header {
    fn default() -> Self {
        Self {
            tos: 0,
            total_length: IPV4_MIN_HEADER_LENGTH as u16,
            identification: 0,
            reserved_bit: false,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: 0,
            crc: 0,
            crc_mode: CrcMode::DeclaredCorrect,
            src: Ipv4Addr::UNSPECIFIED,
            dest: Ipv4Addr::UNSPECIFIED,
            options: Vec::new(),
        }
    }
}

impl Ipv4Header {
    fn options_length(&self) -> usize {
        self.options.iter().map(Ipv4Option::length).sum()
    }

    /// Header length including options padded to a 4-byte boundary.
    pub fn header_length(&self) -> usize {
        IPV4_MIN_HEADER_LENGTH + (self.options_length() + 3) / 4 * 4
    }

    pub fn dscp(&self) -> u8 {
        self.tos >> 2
    }

    pub fn ecn(&self) -> u8 {
        self.tos & 0x03
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        self.tos = (dscp << 2) | self.ecn();
    }

    pub fn set_ecn(&mut self, ecn: u8) {
        self.tos = (self.tos & 0xfc) | (ecn & 0x03);
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }

    /// Payload bytes this header declares.
    pub fn payload_length(&self) -> usize {
        usize::from(self.total_length).saturating_sub(self.header_length())
    }

    /// Options that must appear in every fragment.
    pub fn copied_options(&self) -> Vec<Ipv4Option> {
        self.options
            .iter()
            .filter(|o| o.is_copied())
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> Result<(), WireError> {
        let len = self.header_length();
        if len > IPV4_MAX_HEADER_LENGTH {
            return Err(WireError::TooLong {
                what: "ipv4 header",
                length: len,
                max: IPV4_MAX_HEADER_LENGTH,
            });
        }
        Ok(())
    }

    /// Set `crc` according to `crc_mode`. Computed mode sums the serialized
    /// header with the checksum field zeroed.
    pub fn update_crc(&mut self) {
        self.crc = match self.crc_mode {
            CrcMode::Computed => {
                self.crc = 0;
                internet_checksum(&self.to_bytes())
            }
            mode => mode.sentinel(),
        };
    }

    /// Checksum self-verification of the serialized header.
    pub fn computed_crc_ok(&self) -> bool {
        internet_checksum(&self.to_bytes()) == 0
    }
}

impl FieldsChunk for Ipv4Header {
    fn chunk_length(&self) -> usize {
        self.header_length()
    }

    fn serialize(&self, out: &mut BytesMut) {
        let header_length = self.header_length();
        let mut flags_fragment = (self.fragment_offset / 8) & FRAGMENT_OFFSET_MASK;
        if self.reserved_bit {
            flags_fragment |= FLAG_RESERVED;
        }
        if self.dont_fragment {
            flags_fragment |= FLAG_DONT_FRAGMENT;
        }
        if self.more_fragments {
            flags_fragment |= FLAG_MORE_FRAGMENTS;
        }
        let fixed = Ipv4FixedWire {
            version_ihl: 0x40 | ((header_length / 4) as u8 & 0x0f),
            tos: self.tos,
            total_length: U16::new(self.total_length),
            identification: U16::new(self.identification),
            flags_fragment: U16::new(flags_fragment),
            ttl: self.ttl,
            protocol: self.protocol,
            checksum: U16::new(self.crc),
            src: self.src.octets(),
            dest: self.dest.octets(),
        };
        out.put_slice(fixed.as_bytes());
        let start = out.len();
        for option in &self.options {
            option.write(out);
        }
        let written = out.len() - start;
        out.put_bytes(OPTION_END, header_length - IPV4_MIN_HEADER_LENGTH - written);
    }
}

impl Header for Ipv4Header {
    const MIN_LENGTH: usize = IPV4_MIN_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        require(bytes, IPV4_MIN_HEADER_LENGTH)?;
        let fixed = Ipv4FixedWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: IPV4_MIN_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        let version = fixed.version_ihl >> 4;
        if version != 4 {
            return Err(WireError::BadVersion {
                expected: 4,
                found: version,
            });
        }
        let header_length = usize::from(fixed.version_ihl & 0x0f) * 4;
        if header_length < IPV4_MIN_HEADER_LENGTH {
            return Err(WireError::BadLength {
                what: "ipv4 header length",
                value: header_length,
            });
        }
        require(bytes, header_length)?;
        let options = parse_options(&bytes[IPV4_MIN_HEADER_LENGTH..header_length])?;
        let flags_fragment = fixed.flags_fragment.get();
        let header = Ipv4Header {
            tos: fixed.tos,
            total_length: fixed.total_length.get(),
            identification: fixed.identification.get(),
            reserved_bit: flags_fragment & FLAG_RESERVED != 0,
            dont_fragment: flags_fragment & FLAG_DONT_FRAGMENT != 0,
            more_fragments: flags_fragment & FLAG_MORE_FRAGMENTS != 0,
            fragment_offset: (flags_fragment & FRAGMENT_OFFSET_MASK) * 8,
            ttl: fixed.ttl,
            protocol: fixed.protocol,
            crc: fixed.checksum.get(),
            crc_mode: CrcMode::from_received(fixed.checksum.get()),
            src: Ipv4Addr::from(fixed.src),
            dest: Ipv4Addr::from(fixed.dest),
            options,
        };
        if header.header_length() != header_length {
            // Options parsing stopped early at an End option; keep the
            // advertised length by padding with NOPs.
            let mut header = header;
            while header.header_length() < header_length {
                header.options.push(Ipv4Option::nop());
            }
            return Ok(header);
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Header {
        Ipv4Header {
            tos: 0x2e << 2 | 0x02,
            total_length: 1500,
            identification: 0x1234,
            dont_fragment: true,
            fragment_offset: 1480,
            more_fragments: true,
            ttl: 17,
            protocol: 17,
            crc_mode: CrcMode::Computed,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(10, 0, 1, 2),
            ..Ipv4Header::default()
        }
    }

    #[test]
    fn round_trip_without_options() {
        let mut h = sample();
        h.update_crc();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 20);
        let parsed = Ipv4Header::deserialize(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert!(parsed.computed_crc_ok());
        assert_eq!(parsed.dscp(), 0x2e);
        assert_eq!(parsed.ecn(), 0x02);
    }

    #[test]
    fn round_trip_with_options_padded() {
        let mut h = sample();
        h.options = vec![Ipv4Option::router_alert(), Ipv4Option::record_route(2)];
        // 4 + 11 = 15 bytes of options, padded to 16.
        assert_eq!(h.header_length(), 36);
        h.update_crc();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 36);
        let parsed = Ipv4Header::deserialize(&bytes).unwrap();
        assert_eq!(parsed.options[..2], h.options[..]);
        assert_eq!(parsed.header_length(), 36);
        assert!(parsed.computed_crc_ok());
    }

    #[test]
    fn copy_bit() {
        assert!(Ipv4Option::router_alert().is_copied());
        assert!(!Ipv4Option::record_route(1).is_copied());
        let mut h = sample();
        h.options = vec![Ipv4Option::router_alert(), Ipv4Option::record_route(1)];
        assert_eq!(h.copied_options(), vec![Ipv4Option::router_alert()]);
    }

    #[test]
    fn header_limit() {
        let mut h = sample();
        h.options = vec![Ipv4Option::record_route(9), Ipv4Option::router_alert()];
        assert!(h.validate().is_err());
    }

    #[test]
    fn rejects_bad_version_and_truncation() {
        let mut bytes = sample().to_bytes().to_vec();
        assert!(matches!(
            Ipv4Header::deserialize(&bytes[..10]),
            Err(WireError::Truncated { need: 20, have: 10 })
        ));
        bytes[0] = 0x65;
        assert!(matches!(
            Ipv4Header::deserialize(&bytes),
            Err(WireError::BadVersion { found: 6, .. })
        ));
    }

    #[test]
    fn single_bit_flip_breaks_crc() {
        let mut h = sample();
        h.update_crc();
        let mut bytes = h.to_bytes().to_vec();
        bytes[8] ^= 0x01;
        let parsed = Ipv4Header::deserialize(&bytes).unwrap();
        assert!(!parsed.computed_crc_ok());
    }
}
