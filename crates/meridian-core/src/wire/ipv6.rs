//! IPv6 header (RFC 8200) with its extension-header chain.

use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::{require, WireError};
use crate::chunk::{FieldsChunk, Header};

pub const IPV6_HEADER_LENGTH: usize = 40;
/// Minimum link MTU every IPv6 link must carry.
pub const IPV6_MIN_MTU: usize = 1280;

pub const NEXT_HEADER_HOP_BY_HOP: u8 = 0;
pub const NEXT_HEADER_ROUTING: u8 = 43;
pub const NEXT_HEADER_FRAGMENT: u8 = 44;
pub const NEXT_HEADER_DESTINATION_OPTIONS: u8 = 60;
pub const NEXT_HEADER_NONE: u8 = 59;

pub const OPTION_PAD1: u8 = 0;
pub const OPTION_PADN: u8 = 1;
/// Mobile IPv6 home address destination option (RFC 6275).
pub const OPTION_HOME_ADDRESS: u8 = 201;

// ── Fixed part ────────────────────────────────────────────────────────────────

/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct Ipv6FixedWire {
    version_class_flow: U32<NetworkEndian>,
    payload_length: U16<NetworkEndian>,
    next_header: u8,
    hop_limit: u8,
    src: [u8; 16],
    dest: [u8; 16],
}

assert_eq_size!(Ipv6FixedWire, [u8; 40]);

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct FragmentWire {
    next_header: u8,
    reserved: u8,
    offset_flags: U16<NetworkEndian>,
    identification: U32<NetworkEndian>,
}

assert_eq_size!(FragmentWire, [u8; 8]);

// ── Options ───────────────────────────────────────────────────────────────────

/// Type-length-value option carried in hop-by-hop or destination options.
///
/// Pad1 and PadN are not kept: parsing skips them and writing pads the
/// header to a multiple of 8 octets again. A parsed and rewritten header
/// therefore carries the same options but may be padded differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvOption {
    kind: u8,
    length: u8,
    data: Vec<u8>,
}

impl TlvOption {
    /// Fails if `data` does not fit the one-byte length field.
    pub fn new(kind: u8, data: Vec<u8>) -> Result<Self, WireError> {
        let length = u8::try_from(data.len()).map_err(|_| WireError::TooLong {
            what: "ipv6 option",
            length: data.len(),
            max: usize::from(u8::MAX),
        })?;
        Ok(Self { kind, length, data })
    }

    pub fn home_address(addr: Ipv6Addr) -> Self {
        Self {
            kind: OPTION_HOME_ADDRESS,
            length: 16,
            data: addr.octets().to_vec(),
        }
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn options_length(options: &[TlvOption]) -> usize {
    let raw: usize = 2 + options.iter().map(|o| 2 + o.data.len()).sum::<usize>();
    (raw + 7) / 8 * 8
}

fn write_options(options: &[TlvOption], total: usize, out: &mut BytesMut) {
    let mut written = 2;
    for o in options {
        out.put_u8(o.kind);
        out.put_u8(o.length);
        out.put_slice(&o.data);
        written += 2 + o.data.len();
    }
    match total - written {
        0 => {}
        1 => out.put_u8(OPTION_PAD1),
        pad => {
            out.put_u8(OPTION_PADN);
            out.put_u8((pad - 2) as u8);
            out.put_bytes(0, pad - 2);
        }
    }
}

fn parse_options(mut bytes: &[u8]) -> Result<Vec<TlvOption>, WireError> {
    let mut options = Vec::new();
    while let Some((&kind, rest)) = bytes.split_first() {
        if kind == OPTION_PAD1 {
            bytes = rest;
            continue;
        }
        let len = usize::from(*rest.first().ok_or(WireError::BadOption(kind))?);
        if rest.len() < 1 + len {
            return Err(WireError::BadOption(kind));
        }
        if kind != OPTION_PADN {
            options.push(TlvOption::new(kind, rest[1..1 + len].to_vec())?);
        }
        bytes = &rest[1 + len..];
    }
    Ok(options)
}

// ── Extension headers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv6ExtensionHeader {
    HopByHop {
        options: Vec<TlvOption>,
    },
    Routing {
        routing_type: u8,
        segments_left: u8,
        /// Type-specific data after the first four bytes.
        data: Vec<u8>,
    },
    Fragment {
        /// In bytes; a multiple of 8.
        fragment_offset: u16,
        more_fragments: bool,
        identification: u32,
    },
    DestinationOptions {
        options: Vec<TlvOption>,
    },
}

impl Ipv6ExtensionHeader {
    /// Type-2 routing header (RFC 6275) carrying the home address.
    pub fn type2_routing(home_address: Ipv6Addr) -> Self {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&home_address.octets());
        Ipv6ExtensionHeader::Routing {
            routing_type: 2,
            segments_left: 1,
            data,
        }
    }

    pub fn header_type(&self) -> u8 {
        match self {
            Ipv6ExtensionHeader::HopByHop { .. } => NEXT_HEADER_HOP_BY_HOP,
            Ipv6ExtensionHeader::Routing { .. } => NEXT_HEADER_ROUTING,
            Ipv6ExtensionHeader::Fragment { .. } => NEXT_HEADER_FRAGMENT,
            Ipv6ExtensionHeader::DestinationOptions { .. } => NEXT_HEADER_DESTINATION_OPTIONS,
        }
    }

    pub fn is_extension_type(next_header: u8) -> bool {
        matches!(
            next_header,
            NEXT_HEADER_HOP_BY_HOP
                | NEXT_HEADER_ROUTING
                | NEXT_HEADER_FRAGMENT
                | NEXT_HEADER_DESTINATION_OPTIONS
        )
    }

    /// RFC 8200 §4.1 ordering rank.
    fn order(&self) -> u8 {
        match self {
            Ipv6ExtensionHeader::HopByHop { .. } => 0,
            Ipv6ExtensionHeader::Routing { .. } => 2,
            Ipv6ExtensionHeader::Fragment { .. } => 3,
            Ipv6ExtensionHeader::DestinationOptions { .. } => 4,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Ipv6ExtensionHeader::HopByHop { options }
            | Ipv6ExtensionHeader::DestinationOptions { options } => options_length(options),
            Ipv6ExtensionHeader::Routing { data, .. } => (4 + data.len() + 7) / 8 * 8,
            Ipv6ExtensionHeader::Fragment { .. } => 8,
        }
    }

    /// True if this is part of the unfragmentable prefix.
    pub fn is_unfragmentable(&self) -> bool {
        matches!(
            self,
            Ipv6ExtensionHeader::HopByHop { .. } | Ipv6ExtensionHeader::Routing { .. }
        )
    }

    fn write(&self, next_header: u8, out: &mut BytesMut) {
        let length = self.length();
        match self {
            Ipv6ExtensionHeader::HopByHop { options }
            | Ipv6ExtensionHeader::DestinationOptions { options } => {
                out.put_u8(next_header);
                out.put_u8((length / 8 - 1) as u8);
                write_options(options, length, out);
            }
            Ipv6ExtensionHeader::Routing {
                routing_type,
                segments_left,
                data,
            } => {
                out.put_u8(next_header);
                out.put_u8((length / 8 - 1) as u8);
                out.put_u8(*routing_type);
                out.put_u8(*segments_left);
                out.put_slice(data);
                out.put_bytes(0, length - 4 - data.len());
            }
            Ipv6ExtensionHeader::Fragment {
                fragment_offset,
                more_fragments,
                identification,
            } => {
                let wire = FragmentWire {
                    next_header,
                    reserved: 0,
                    offset_flags: U16::new((fragment_offset & 0xfff8) | u16::from(*more_fragments)),
                    identification: U32::new(*identification),
                };
                out.put_slice(wire.as_bytes());
            }
        }
    }

    /// Parse one extension header of type `header_type`. Returns the header,
    /// its next-header value, and its length.
    fn parse(header_type: u8, bytes: &[u8]) -> Result<(Self, u8, usize), WireError> {
        require(bytes, 8)?;
        let next_header = bytes[0];
        if header_type == NEXT_HEADER_FRAGMENT {
            let wire = FragmentWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
                need: 8,
                have: bytes.len(),
            })?;
            let offset_flags = wire.offset_flags.get();
            let header = Ipv6ExtensionHeader::Fragment {
                fragment_offset: offset_flags & 0xfff8,
                more_fragments: offset_flags & 1 != 0,
                identification: wire.identification.get(),
            };
            return Ok((header, next_header, 8));
        }
        let length = (usize::from(bytes[1]) + 1) * 8;
        require(bytes, length)?;
        let body = &bytes[2..length];
        let header = match header_type {
            NEXT_HEADER_HOP_BY_HOP => Ipv6ExtensionHeader::HopByHop {
                options: parse_options(body)?,
            },
            NEXT_HEADER_DESTINATION_OPTIONS => Ipv6ExtensionHeader::DestinationOptions {
                options: parse_options(body)?,
            },
            NEXT_HEADER_ROUTING => {
                let data = body[2..].to_vec();
                Ipv6ExtensionHeader::Routing {
                    routing_type: body[0],
                    segments_left: body[1],
                    data,
                }
            }
            other => {
                return Err(WireError::UnknownType {
                    what: "ipv6 extension header",
                    value: other,
                })
            }
        };
        Ok((header, next_header, length))
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed header plus extension headers. `protocol` is the upper-layer
/// protocol number that follows the last extension header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub protocol: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dest: Ipv6Addr,
    pub extension_headers: Vec<Ipv6ExtensionHeader>,
}

impl Default for Ipv6Header {
    fn default() -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            payload_length: 0,
            protocol: NEXT_HEADER_NONE,
            hop_limit: 64,
            src: Ipv6Addr::UNSPECIFIED,
            dest: Ipv6Addr::UNSPECIFIED,
            extension_headers: Vec::new(),
        }
    }
}

impl Ipv6Header {
    pub fn header_length(&self) -> usize {
        IPV6_HEADER_LENGTH
            + self
                .extension_headers
                .iter()
                .map(Ipv6ExtensionHeader::length)
                .sum::<usize>()
    }

    /// Fixed header plus the extension headers that precede fragmentation.
    pub fn unfragmentable_length(&self) -> usize {
        IPV6_HEADER_LENGTH
            + self
                .extension_headers
                .iter()
                .filter(|h| h.is_unfragmentable())
                .map(Ipv6ExtensionHeader::length)
                .sum::<usize>()
    }

    pub fn dscp(&self) -> u8 {
        self.traffic_class >> 2
    }

    pub fn ecn(&self) -> u8 {
        self.traffic_class & 0x03
    }

    pub fn set_dscp(&mut self, dscp: u8) {
        self.traffic_class = (dscp << 2) | self.ecn();
    }

    pub fn set_ecn(&mut self, ecn: u8) {
        self.traffic_class = (self.traffic_class & 0xfc) | (ecn & 0x03);
    }

    /// Insert keeping the RFC 8200 recommended order.
    pub fn add_extension_header(&mut self, header: Ipv6ExtensionHeader) {
        let at = self
            .extension_headers
            .iter()
            .position(|h| h.order() > header.order())
            .unwrap_or(self.extension_headers.len());
        self.extension_headers.insert(at, header);
    }

    pub fn fragment_header(&self) -> Option<(u16, bool, u32)> {
        self.extension_headers.iter().find_map(|h| match h {
            Ipv6ExtensionHeader::Fragment {
                fragment_offset,
                more_fragments,
                identification,
            } => Some((*fragment_offset, *more_fragments, *identification)),
            _ => None,
        })
    }

    pub fn remove_fragment_header(&mut self) {
        self.extension_headers
            .retain(|h| !matches!(h, Ipv6ExtensionHeader::Fragment { .. }));
    }

    /// Bytes this datagram occupies on the wire.
    pub fn total_length(&self) -> usize {
        IPV6_HEADER_LENGTH + usize::from(self.payload_length)
    }
}

impl FieldsChunk for Ipv6Header {
    fn chunk_length(&self) -> usize {
        self.header_length()
    }

    fn serialize(&self, out: &mut BytesMut) {
        let first = self
            .extension_headers
            .first()
            .map(Ipv6ExtensionHeader::header_type)
            .unwrap_or(self.protocol);
        let fixed = Ipv6FixedWire {
            version_class_flow: U32::new(
                (6 << 28) | (u32::from(self.traffic_class) << 20) | (self.flow_label & 0x000f_ffff),
            ),
            payload_length: U16::new(self.payload_length),
            next_header: first,
            hop_limit: self.hop_limit,
            src: self.src.octets(),
            dest: self.dest.octets(),
        };
        out.put_slice(fixed.as_bytes());
        for (i, ext) in self.extension_headers.iter().enumerate() {
            let next = self
                .extension_headers
                .get(i + 1)
                .map(Ipv6ExtensionHeader::header_type)
                .unwrap_or(self.protocol);
            ext.write(next, out);
        }
    }
}

impl Header for Ipv6Header {
    const MIN_LENGTH: usize = IPV6_HEADER_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let fixed = Ipv6FixedWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: IPV6_HEADER_LENGTH,
            have: bytes.len(),
        })?;
        let vcf = fixed.version_class_flow.get();
        let version = (vcf >> 28) as u8;
        if version != 6 {
            return Err(WireError::BadVersion {
                expected: 6,
                found: version,
            });
        }
        let mut extension_headers = Vec::new();
        let mut next = fixed.next_header;
        let mut at = IPV6_HEADER_LENGTH;
        // Whatever follows a fragment header is fragmentable payload.
        while Ipv6ExtensionHeader::is_extension_type(next) {
            let (ext, following, len) = Ipv6ExtensionHeader::parse(next, &bytes[at..])?;
            let fragment = matches!(ext, Ipv6ExtensionHeader::Fragment { .. });
            extension_headers.push(ext);
            next = following;
            at += len;
            if fragment {
                break;
            }
        }
        Ok(Ipv6Header {
            traffic_class: ((vcf >> 20) & 0xff) as u8,
            flow_label: vcf & 0x000f_ffff,
            payload_length: fixed.payload_length.get(),
            protocol: next,
            hop_limit: fixed.hop_limit,
            src: Ipv6Addr::from(fixed.src),
            dest: Ipv6Addr::from(fixed.dest),
            extension_headers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv6Header {
        Ipv6Header {
            traffic_class: 0xb8,
            flow_label: 0xabcde,
            payload_length: 100,
            protocol: 17,
            hop_limit: 9,
            src: "2001:db8::1".parse().unwrap(),
            dest: "2001:db8:1::2".parse().unwrap(),
            extension_headers: Vec::new(),
        }
    }

    #[test]
    fn round_trip_fixed() {
        let h = sample();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes[6], 17);
        assert_eq!(Ipv6Header::deserialize(&bytes).unwrap(), h);
    }

    #[test]
    fn round_trip_extension_chain() {
        let mut h = sample();
        h.add_extension_header(Ipv6ExtensionHeader::Fragment {
            fragment_offset: 1232,
            more_fragments: true,
            identification: 77,
        });
        h.add_extension_header(Ipv6ExtensionHeader::HopByHop {
            options: vec![TlvOption::new(5, vec![0, 0]).unwrap()],
        });
        h.add_extension_header(Ipv6ExtensionHeader::type2_routing(
            "2001:db8::99".parse().unwrap(),
        ));
        let order: Vec<u8> = h.extension_headers.iter().map(|e| e.header_type()).collect();
        assert_eq!(order, vec![0, 43, 44]);

        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), h.header_length());
        assert_eq!(bytes[6], NEXT_HEADER_HOP_BY_HOP);
        let parsed = Ipv6Header::deserialize(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.fragment_header(), Some((1232, true, 77)));
        // Hop-by-hop (8) and type-2 routing (24) are unfragmentable.
        assert_eq!(parsed.unfragmentable_length(), 40 + 8 + 24);
    }

    #[test]
    fn destination_options_round_trip() {
        let mut h = sample();
        h.add_extension_header(Ipv6ExtensionHeader::DestinationOptions {
            options: vec![TlvOption::home_address("2001:db8::99".parse().unwrap())],
        });
        let bytes = h.to_bytes();
        assert_eq!(bytes[6], NEXT_HEADER_DESTINATION_OPTIONS);
        assert_eq!(Ipv6Header::deserialize(&bytes).unwrap(), h);
    }

    #[test]
    fn oversized_option_is_rejected() {
        assert!(matches!(
            TlvOption::new(30, vec![0; 256]),
            Err(WireError::TooLong { length: 256, max: 255, .. })
        ));
        let largest = TlvOption::new(30, vec![7; 255]).unwrap();
        let mut h = sample();
        h.add_extension_header(Ipv6ExtensionHeader::DestinationOptions {
            options: vec![largest.clone()],
        });
        let parsed = Ipv6Header::deserialize(&h.to_bytes()).unwrap();
        assert_eq!(
            parsed.extension_headers,
            vec![Ipv6ExtensionHeader::DestinationOptions { options: vec![largest] }]
        );
    }

    #[test]
    fn padding_options_are_dropped_and_restored() {
        let mut h = sample();
        h.protocol = NEXT_HEADER_NONE;
        let mut bytes = h.to_bytes().to_vec();
        bytes[6] = NEXT_HEADER_DESTINATION_OPTIONS;
        // 16 bytes: option 30 with two data bytes, then Pad1 and a PadN
        // that pads further than needed.
        bytes.extend_from_slice(&[NEXT_HEADER_NONE, 1, 30, 2, 0xaa, 0xbb, OPTION_PAD1, OPTION_PADN, 7]);
        bytes.extend_from_slice(&[0; 7]);
        let parsed = Ipv6Header::deserialize(&bytes).unwrap();
        let option = TlvOption::new(30, vec![0xaa, 0xbb]).unwrap();
        assert_eq!(
            parsed.extension_headers,
            vec![Ipv6ExtensionHeader::DestinationOptions { options: vec![option] }]
        );
        // Rewritten with minimal padding: the same option in eight bytes.
        let rewritten = parsed.to_bytes();
        assert_eq!(rewritten.len(), IPV6_HEADER_LENGTH + 8);
        assert_eq!(&rewritten[40..46], &[NEXT_HEADER_NONE, 0, 30, 2, 0xaa, 0xbb]);
        assert_eq!(Ipv6Header::deserialize(&rewritten).unwrap(), parsed);
    }

    #[test]
    fn parsing_stops_at_the_fragment_header() {
        let mut h = sample();
        h.protocol = NEXT_HEADER_DESTINATION_OPTIONS;
        h.add_extension_header(Ipv6ExtensionHeader::Fragment {
            fragment_offset: 8,
            more_fragments: false,
            identification: 3,
        });
        let mut bytes = h.to_bytes().to_vec();
        // Mid-datagram bytes that do not parse as an extension header.
        bytes.extend_from_slice(&[0xff; 4]);
        let parsed = Ipv6Header::deserialize(&bytes).unwrap();
        assert_eq!(parsed.protocol, NEXT_HEADER_DESTINATION_OPTIONS);
        assert_eq!(parsed.header_length(), 48);
    }

    #[test]
    fn remove_fragment_header() {
        let mut h = sample();
        h.add_extension_header(Ipv6ExtensionHeader::Fragment {
            fragment_offset: 0,
            more_fragments: false,
            identification: 1,
        });
        h.remove_fragment_header();
        assert!(h.fragment_header().is_none());
        assert_eq!(h.header_length(), 40);
    }

    #[test]
    fn truncated_extension_header() {
        let mut h = sample();
        h.add_extension_header(Ipv6ExtensionHeader::HopByHop { options: vec![] });
        let bytes = h.to_bytes();
        assert!(matches!(
            Ipv6Header::deserialize(&bytes[..44]),
            Err(WireError::Truncated { .. })
        ));
    }
}
