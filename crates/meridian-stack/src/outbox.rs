//! What an engine asks its surroundings to do with a packet.

use meridian_core::wire::icmp::{IcmpType, Icmpv6Type};
use meridian_core::Packet;

use crate::dispatcher::Command;

#[derive(Debug)]
pub enum Emit {
    /// Down to the link layer. Carries `InterfaceReq` and `MacAddressReq`.
    ToLink(Packet),
    /// Up through the transport/network dispatcher.
    ToUpper(Packet),
    /// A socket indication travelling up.
    CommandUp(Command),
    /// Report `packet` (positioned at its IPv4 header) with an ICMP error.
    Icmpv4Error {
        packet: Packet,
        icmp_type: IcmpType,
        code: u8,
        /// Next-hop MTU or parameter-problem pointer.
        value: u32,
    },
    Icmpv6Error {
        packet: Packet,
        icmp_type: Icmpv6Type,
        code: u8,
        value: u32,
    },
    /// A datagram that needs a next hop or a link address from Neighbour
    /// Discovery. Positioned at its IPv6 header.
    ToNeighbourDiscovery(Packet),
    /// A received ND message (ICMPv6 types 133–137).
    NeighbourDiscoveryMessage(Packet),
    /// A datagram whose extension headers belong to mobile IPv6.
    ToMobility(Packet),
    /// A datagram for, or a payload from, an IP-in-IP tunnel.
    ToTunnel(Packet),
}

pub type Outbox = Vec<Emit>;
