//! Neighbour solicitation and advertisement bodies (RFC 4861 §4.3, §4.4).
//!
//! The ICMPv6 header in front carries the type and, for advertisements, the
//! router/solicited/override flags in its four "rest" bytes.

use std::net::Ipv6Addr;

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use super::WireError;
use crate::address::MacAddress;
use crate::chunk::{FieldsChunk, Header};

pub const NDP_BODY_LENGTH: usize = 24;

pub const OPTION_SOURCE_LINK_LAYER: u8 = 1;
pub const OPTION_TARGET_LINK_LAYER: u8 = 2;

pub const FLAG_ROUTER: u32 = 0x8000_0000;
pub const FLAG_SOLICITED: u32 = 0x4000_0000;
pub const FLAG_OVERRIDE: u32 = 0x2000_0000;

/// Wire size: 24 bytes. Target address plus one link-layer address option.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct NdpWire {
    target: [u8; 16],
    option_type: u8,
    option_length: u8,
    link_layer: [u8; 6],
}

assert_eq_size!(NdpWire, [u8; 24]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdpBody {
    pub target: Ipv6Addr,
    /// Source link-layer option for solicitations, target link-layer
    /// option for advertisements.
    pub option_type: u8,
    pub link_layer: MacAddress,
}

impl FieldsChunk for NdpBody {
    fn chunk_length(&self) -> usize {
        NDP_BODY_LENGTH
    }

    fn serialize(&self, out: &mut BytesMut) {
        let wire = NdpWire {
            target: self.target.octets(),
            option_type: self.option_type,
            option_length: 1,
            link_layer: self.link_layer.octets(),
        };
        out.put_slice(wire.as_bytes());
    }
}

impl Header for NdpBody {
    const MIN_LENGTH: usize = NDP_BODY_LENGTH;

    fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
        let wire = NdpWire::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: NDP_BODY_LENGTH,
            have: bytes.len(),
        })?;
        if wire.option_length != 1 {
            return Err(WireError::BadOption(wire.option_type));
        }
        Ok(NdpBody {
            target: Ipv6Addr::from(wire.target),
            option_type: wire.option_type,
            link_layer: MacAddress(wire.link_layer),
        })
    }
}
