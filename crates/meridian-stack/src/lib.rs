//! meridian-stack: the protocol layers that sit on top of meridian-core.
//!
//! Engines are plain single-owner state machines. They never call each
//! other directly: every handler takes a context of collaborators plus an
//! outbox, and `Node` moves the emitted packets between components.

pub mod crc_insertion;
pub mod dispatcher;
pub mod ecn;
pub mod ethernet;
pub mod icmp;
pub mod interface;
pub mod ipv4;
pub mod ipv6;
pub mod netfilter;
pub mod node;
pub mod outbox;
pub mod raw_socket;
pub mod reassembly;
pub mod red;
pub mod resolver;
pub mod routing;
pub mod stats;
pub mod udp;

pub use dispatcher::{DispatchError, Message, MessageDispatcher, PortId, PortSide};
pub use interface::{InterfaceTable, NetworkInterface};
pub use netfilter::{HookChain, HookHandle, HookPoint, NetfilterHook, QueueTicket, Verdict};
pub use node::Node;
pub use outbox::{Emit, Outbox};
pub use stats::{DropCounters, DropReason};

/// Errors that abort processing of one packet. The node logs them and
/// counts the packet as dropped. `MtuTooSmall` is the exception: it marks a
/// misconfigured interface and is returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Packet(#[from] meridian_core::PacketError),
    #[error(transparent)]
    Wire(#[from] meridian_core::wire::WireError),
    #[error("mtu {mtu} of {interface} leaves no room after a {header_length}-byte header")]
    MtuTooSmall {
        interface: String,
        mtu: usize,
        header_length: usize,
    },
    #[error("tos request conflicts with a dscp or ecn request")]
    TosConflict,
    #[error("source address {0} is not assigned to any interface")]
    NonLocalSource(std::net::IpAddr),
    #[error("unknown interface {0}")]
    UnknownInterface(meridian_core::InterfaceId),
    #[error("address family does not match this engine: {0}")]
    WrongFamily(std::net::IpAddr),
    #[error("cannot fragment: {0}")]
    Unfragmentable(&'static str),
    #[error("no ethertype for protocol {0}")]
    NoEtherType(meridian_core::Protocol),
}
