//! On-wire header types for every protocol the stack frames.
//!
//! Each header is a plain Rust struct implementing `Header`; the fixed part
//! of its layout is a `#[repr(C)]` zerocopy struct with network-endian
//! fields, so serialization is a byte copy plus any variable-length tail.
//! There is no unsafe code in this module.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod ndp;
pub mod pim;
pub mod tcp;
pub mod udp;

pub use arp::{ArpOpcode, ArpPacket};
pub use ethernet::{EthernetFcs, EthernetMacHeader};
pub use icmp::{IcmpHeader, IcmpType, Icmpv6Header, Icmpv6Type};
pub use ipv4::{Ipv4Header, Ipv4Option};
pub use ipv6::{Ipv6ExtensionHeader, Ipv6Header, TlvOption};
pub use ndp::NdpBody;
pub use pim::PimHeader;
pub use tcp::TcpHeader;
pub use udp::UdpHeader;

/// Errors produced while parsing or building wire headers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unexpected version {found} (expected {expected})")]
    BadVersion { expected: u8, found: u8 },
    #[error("invalid {what}: {value}")]
    BadLength { what: &'static str, value: usize },
    #[error("{what} of {length} bytes exceeds the {max}-byte limit")]
    TooLong {
        what: &'static str,
        length: usize,
        max: usize,
    },
    #[error("malformed option of kind {0}")]
    BadOption(u8),
    #[error("unknown {what} type {value}")]
    UnknownType { what: &'static str, value: u8 },
}

/// Fail with `Truncated` unless `bytes` holds at least `need` bytes.
pub(crate) fn require(bytes: &[u8], need: usize) -> Result<(), WireError> {
    if bytes.len() < need {
        Err(WireError::Truncated {
            need,
            have: bytes.len(),
        })
    } else {
        Ok(())
    }
}
