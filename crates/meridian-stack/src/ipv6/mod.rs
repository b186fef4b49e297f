//! IPv6 engine: routing through the destination cache, Neighbour Discovery
//! hand-off, extension-header dispatch, fragmentation of local traffic and
//! reassembly.
//!
//! ```text
//!  lower ─▶ check ─▶ PREROUTING ─┬─▶ local ─▶ reassemble ─▶ LOCALIN ─▶ ext hdrs ─▶ upper
//!                                ├─▶ multicast ─▶ replicate ─────────┐
//!                                └─▶ unicast ─▶ FORWARD ─▶ resolve ──┤
//!  upper ─▶ encapsulate ─▶ LOCALOUT ─▶ route ─▶ resolve ─────────────┴▶ POSTROUTING
//!                                                    ─▶ fragment ─▶ link
//! ```
//!
//! Link-address misses and hosts without a route leave the engine as
//! `Emit::ToNeighbourDiscovery`; the node brings them back through
//! [`Ipv6::send_resolved`] or [`Ipv6::neighbour_unreachable`].

mod dest_cache;

pub use dest_cache::{DestinationCache, DestinationEntry};

use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use bytes::BytesMut;
use serde::Serialize;

use meridian_core::address::{ipv6_prefix_matches, Ipv6AddrExt};
use meridian_core::config::Ipv6Config;
use meridian_core::protocol::{self, ip_protocol_number, IP_PROTOCOLS};
use meridian_core::tags::{
    DispatchProtocolReq, DscpInd, DscpReq, EcnInd, EcnReq, HopLimitInd, HopLimitReq, InterfaceInd,
    InterfaceReq, Ipv6ExtHeaderReq, L3AddressInd, L3AddressReq, MacAddressReq, MulticastReq,
    NetworkProtocolInd, NextHopAddressReq, PacketProtocolTag, SocketInd, TosInd, TosReq,
};
use meridian_core::wire::icmp::{
    parameter_problem_v6, time_exceeded_v6, unreachable_v6, Icmpv6Header, Icmpv6Type,
};
use meridian_core::wire::ipv6::{
    Ipv6ExtensionHeader, Ipv6Header, IPV6_HEADER_LENGTH, OPTION_HOME_ADDRESS,
};
use meridian_core::{Chunk, InterfaceId, MacAddress, Packet, PacketError, Protocol, SimTime};

use crate::dispatcher::Command;
use crate::interface::{InterfaceTable, NetworkInterface, LOOPBACK_ID};
use crate::netfilter::{HookChain, HookOutcome, HookPoint, QueueTicket};
use crate::outbox::{Emit, Outbox};
use crate::raw_socket::RawSocketTable;
use crate::reassembly::{Fragment, Reassembled, ReassemblyBuffer};
use crate::resolver::NeighbourResolver;
use crate::routing::Ipv6RoutingTable;
use crate::stats::{DropCounters, DropReason};
use crate::EngineError;

/// Minimum spacing between sweeps of the fragment buffer.
const PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// Delay between attempts to send from a tentative address.
const TENTATIVE_RETRY: Duration = Duration::from_secs(1);

const FRAGMENT_HEADER_LENGTH: usize = 8;

/// Collaborators the engine borrows for the duration of one call.
pub struct Ipv6Context<'a> {
    pub interfaces: &'a InterfaceTable,
    pub routes: &'a dyn Ipv6RoutingTable,
    pub neighbours: &'a dyn NeighbourResolver,
    pub now: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv6Addr,
    dest: Ipv6Addr,
    identification: u32,
}

/// A datagram held back because its source address is still tentative.
#[derive(Debug)]
struct TentativeDatagram {
    packet: Packet,
    retries: u32,
    next_retry: SimTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Ipv6Stats {
    pub received: u64,
    pub sent_from_upper: u64,
    pub forwarded: u64,
    pub local_deliveries: u64,
    pub multicast: u64,
    pub unroutable: u64,
    pub fragments_created: u64,
    pub reassembled: u64,
    pub tunnelled: u64,
    pub to_mobility: u64,
    pub tentative_requeued: u64,
    pub dropped: DropCounters,
}

#[derive(Debug)]
pub struct Ipv6 {
    default_hop_limit: u8,
    fragment_timeout: Duration,
    cache_lifetime: Duration,
    tentative_retry_limit: u32,
    identification: u32,
    hooks: HookChain,
    fragments: ReassemblyBuffer<FragmentKey, Ipv6Header>,
    last_purge: SimTime,
    dest_cache: DestinationCache,
    tentative: Vec<TentativeDatagram>,
    /// Destination prefixes served by a tunnel.
    tunnels: Vec<(Ipv6Addr, u8)>,
    sockets: RawSocketTable,
    upper_protocols: HashSet<Protocol>,
    pub stats: Ipv6Stats,
}

impl Ipv6 {
    pub fn new(config: &Ipv6Config) -> Self {
        Self {
            default_hop_limit: config.default_hop_limit,
            fragment_timeout: Duration::from_secs(config.fragment_timeout_secs),
            cache_lifetime: Duration::from_secs(config.destination_cache_lifetime_secs),
            tentative_retry_limit: config.tentative_retry_limit,
            identification: 0,
            hooks: HookChain::new(),
            fragments: ReassemblyBuffer::new(),
            last_purge: SimTime::ZERO,
            dest_cache: DestinationCache::new(),
            tentative: Vec::new(),
            tunnels: Vec::new(),
            sockets: RawSocketTable::new(),
            upper_protocols: HashSet::new(),
            stats: Ipv6Stats::default(),
        }
    }

    pub fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookChain {
        &mut self.hooks
    }

    pub fn destination_cache(&self) -> &DestinationCache {
        &self.dest_cache
    }

    pub fn raw_sockets(&self) -> &RawSocketTable {
        &self.sockets
    }

    pub fn fragments_outstanding(&self) -> usize {
        self.fragments.len()
    }

    /// Datagrams waiting for their source address to become preferred.
    pub fn tentative_len(&self) -> usize {
        self.tentative.len()
    }

    pub fn register_upper_protocol(&mut self, protocol: Protocol) {
        tracing::debug!(protocol = %protocol, "ipv6 upper protocol registered");
        self.upper_protocols.insert(protocol);
    }

    /// Send datagrams for `prefix` to the tunneling module.
    pub fn add_tunnel(&mut self, prefix: Ipv6Addr, prefix_len: u8) {
        tracing::debug!(prefix = %prefix, prefix_len, "tunnel added");
        self.tunnels.push((prefix, prefix_len));
    }

    fn drop_packet(&mut self, packet: &Packet, reason: DropReason) {
        tracing::debug!(packet = packet.name(), reason = %reason, "ipv6 dropped");
        self.stats.dropped.record(reason);
    }

    fn run_hooks(&mut self, point: HookPoint, packet: Packet) -> Option<Packet> {
        match self.hooks.run(point, packet) {
            HookOutcome::Accept(packet) => Some(packet),
            HookOutcome::Dropped { hook } => {
                tracing::debug!(hook = %hook, point = %point, "datagram dropped by hook");
                self.stats.dropped.record(DropReason::Filtered);
                None
            }
            HookOutcome::Queued(ticket) => {
                tracing::trace!(?ticket, point = %point, "datagram queued by hook");
                None
            }
            HookOutcome::Stolen { hook } => {
                tracing::trace!(hook = %hook, point = %point, "datagram stolen by hook");
                None
            }
        }
    }

    fn icmp_error(packet: Packet, icmp_type: Icmpv6Type, code: u8, value: u32, out: &mut Outbox) {
        out.push(Emit::Icmpv6Error {
            packet,
            icmp_type,
            code,
            value,
        });
    }

    // ── From the link layer ──────────────────────────────────────────────────

    /// A datagram from the link layer, carrying `InterfaceInd`.
    pub fn handle_from_lower(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        self.stats.received += 1;
        packet.get_tag::<InterfaceInd>()?;
        packet.trim();

        // No header checksum here: the link layer should have caught it.
        if packet.bit_error || !packet.is_data_correct() {
            tracing::warn!(packet = packet.name(), "bit error reached ipv6");
            self.drop_packet(&packet, DropReason::Malformed);
            return Ok(());
        }
        let header = match packet.peek_at_front::<Ipv6Header>() {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(packet = packet.name(), error = %e, "unparseable ipv6 header");
                self.drop_packet(&packet, DropReason::Malformed);
                return Ok(());
            }
        };
        let total = header.total_length();
        if total > packet.data_length() || total < header.header_length() {
            tracing::warn!(
                packet = packet.name(),
                total_length = total,
                buffered = packet.data_length(),
                "ipv6 length error"
            );
            self.drop_packet(&packet, DropReason::Malformed);
            return Ok(());
        }
        if total < packet.data_length() {
            packet.set_back_offset(packet.front_offset() + total)?;
            packet.trim();
        }
        packet.set_tag(NetworkProtocolInd {
            protocol: protocol::IPV6,
            header: Chunk::fields(header.clone()),
        });

        tracing::trace!(packet = packet.name(), dest = %header.dest, "ipv6 received");
        if let Some(packet) = self.run_hooks(HookPoint::PreRouting, packet) {
            self.prerouting_finish(packet, ctx, out)?;
        }
        Ok(())
    }

    fn prerouting_finish(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let interfaces = ctx.interfaces;
        let from = packet.get_tag::<InterfaceInd>()?.0;
        let from_if = interfaces
            .get(from)
            .ok_or(EngineError::UnknownInterface(from))?;
        let header = packet.peek_at_front::<Ipv6Header>()?;
        let dest = header.dest;

        if from_if.loopback {
            return self.local_deliver(packet, ctx, out);
        }

        if dest.is_multicast() {
            self.stats.multicast += 1;
            let router = ctx.routes.is_router();
            if from_if.is_member_v6(dest, router) {
                self.local_deliver(packet.dup(), ctx, out)?;
            }
            if !router {
                tracing::trace!(group = %dest, "not a router, multicast not forwarded");
            } else if dest.scope_id() <= 2 {
                tracing::trace!(group = %dest, "link-scope multicast not forwarded");
            } else {
                let packet = Self::prepare_for_forwarding(packet)?;
                self.forward_multicast(packet, from, ctx, out)?;
            }
            return Ok(());
        }

        if interfaces.is_local_address_v6(dest) {
            return self.local_deliver(packet, ctx, out);
        }
        if !ctx.routes.is_router() {
            self.drop_packet(&packet, DropReason::ForwardingDisabled);
            return Ok(());
        }
        if dest.is_link_local() || dest.is_loopback() {
            tracing::debug!(dest = %dest, "link-local destination not forwarded");
            self.drop_packet(&packet, DropReason::NoRouteFound);
            return Ok(());
        }
        let packet = Self::prepare_for_forwarding(packet)?;
        self.route_unicast(packet, Some(from), ctx, out)
    }

    /// Decrement the hop limit in place. Expiry is caught just before
    /// sending.
    fn prepare_for_forwarding(mut packet: Packet) -> Result<Packet, EngineError> {
        let mut header = packet.remove_at_front::<Ipv6Header>()?;
        header.hop_limit = header.hop_limit.saturating_sub(1);
        packet.insert_at_front(Chunk::fields(header))?;
        Ok(packet)
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    fn route_unicast(
        &mut self,
        mut packet: Packet,
        from: Option<InterfaceId>,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv6Header>()?;
        let dest = header.dest;

        if let Some(id) = packet.find_tag::<InterfaceReq>().map(|t| t.0) {
            let iface = ctx
                .interfaces
                .get(id)
                .ok_or(EngineError::UnknownInterface(id))?;
            let has_next_hop = packet
                .find_tag::<NextHopAddressReq>()
                .is_some_and(|t| !t.0.is_unspecified());
            if !has_next_hop {
                let next_hop = if dest.is_link_local() || iface.on_link_v6(dest) {
                    dest
                } else {
                    ctx.routes
                        .best_matching_route(dest, ctx.now)
                        .filter(|r| r.interface == id && !r.next_hop.is_unspecified())
                        .map_or(dest, |r| r.next_hop)
                };
                packet.set_tag(NextHopAddressReq(IpAddr::V6(next_hop)));
            }
        } else if self.is_tunnelled(&header) {
            tracing::debug!(dest = %dest, "destination covered by a tunnel");
            self.stats.tunnelled += 1;
            out.push(Emit::ToTunnel(packet));
            return Ok(());
        } else if let Some(entry) = self.dest_cache.lookup(dest, ctx.now) {
            tracing::trace!(dest = %dest, next_hop = %entry.next_hop, "destination cache hit");
            packet.set_tag(InterfaceReq(entry.interface));
            packet.set_tag(NextHopAddressReq(IpAddr::V6(entry.next_hop)));
        } else {
            match ctx.routes.best_matching_route(dest, ctx.now) {
                Some(route) => {
                    let next_hop = if route.next_hop.is_unspecified() {
                        dest
                    } else {
                        route.next_hop
                    };
                    let lifetime_end = ctx.now + self.cache_lifetime;
                    let expires = route.expires.map_or(lifetime_end, |at| at.min(lifetime_end));
                    self.dest_cache.insert(
                        dest,
                        DestinationEntry {
                            next_hop,
                            interface: route.interface,
                            expires,
                        },
                    );
                    tracing::trace!(dest = %dest, next_hop = %next_hop, interface = %route.interface, "route found");
                    packet.set_tag(InterfaceReq(route.interface));
                    packet.set_tag(NextHopAddressReq(IpAddr::V6(next_hop)));
                }
                None if ctx.routes.is_router() => {
                    tracing::debug!(dest = %dest, "no route");
                    self.stats.unroutable += 1;
                    self.stats.dropped.record(DropReason::NoRouteFound);
                    Self::icmp_error(
                        packet,
                        Icmpv6Type::DestinationUnreachable,
                        unreachable_v6::NO_ROUTE,
                        0,
                        out,
                    );
                    return Ok(());
                }
                None => {
                    tracing::debug!(dest = %dest, "no route, asking neighbour discovery for a default router");
                    out.push(Emit::ToNeighbourDiscovery(packet));
                    return Ok(());
                }
            }
        }

        if from.is_some() {
            if let Some(packet) = self.run_hooks(HookPoint::Forward, packet) {
                self.route_unicast_finish(packet, ctx, out)?;
            }
            Ok(())
        } else {
            self.route_unicast_finish(packet, ctx, out)
        }
    }

    /// Datagrams already carrying a tunnelled payload or extension headers
    /// are never tunnelled again.
    fn is_tunnelled(&self, header: &Ipv6Header) -> bool {
        let already = ip_protocol_number(protocol::IPV6) == Some(header.protocol);
        !already
            && header.extension_headers.is_empty()
            && self
                .tunnels
                .iter()
                .any(|(prefix, len)| ipv6_prefix_matches(*prefix, *len, header.dest))
    }

    fn route_unicast_finish(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        if packet.find_tag::<InterfaceInd>().is_some() {
            self.stats.forwarded += 1;
        }
        self.resolve_and_send(packet, ctx, out)
    }

    fn forward_multicast(
        &mut self,
        packet: Packet,
        from: InterfaceId,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let group = packet.peek_at_front::<Ipv6Header>()?.dest;
        let targets: Vec<InterfaceId> = ctx
            .interfaces
            .iter()
            .filter(|i| !i.loopback && i.id != from)
            .map(|i| i.id)
            .collect();
        self.stats.forwarded += 1;
        for id in targets {
            let mut copy = packet.dup();
            copy.set_tag(InterfaceReq(id));
            copy.set_tag(NextHopAddressReq(IpAddr::V6(group)));
            self.resolve_and_send(copy, ctx, out)?;
        }
        Ok(())
    }

    /// Link address for the next hop, or a detour through Neighbour
    /// Discovery.
    fn resolve_and_send(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = ctx
            .interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        let next_hop = match packet.find_tag::<NextHopAddressReq>() {
            Some(NextHopAddressReq(IpAddr::V6(hop))) if !hop.is_unspecified() => *hop,
            _ => {
                let dest = packet.peek_at_front::<Ipv6Header>()?.dest;
                packet.set_tag(NextHopAddressReq(IpAddr::V6(dest)));
                dest
            }
        };

        if iface.loopback || !iface.broadcast || iface.point_to_point {
            return self.fragment_post_routing(packet, ctx, out);
        }
        let mac = if next_hop.is_multicast() {
            Some(MacAddress::multicast_for_ipv6(next_hop))
        } else {
            ctx.neighbours.lookup(next_hop, id, ctx.now)
        };
        match mac {
            Some(dest) => {
                packet.set_tag(MacAddressReq {
                    src: iface.mac,
                    dest,
                });
                self.fragment_post_routing(packet, ctx, out)
            }
            None => {
                tracing::debug!(next_hop = %next_hop, interface = %iface.name, "no link address yet");
                out.push(Emit::ToNeighbourDiscovery(packet));
                Ok(())
            }
        }
    }

    // ── Neighbour Discovery notifications ───────────────────────────────────

    /// A datagram Neighbour Discovery resolved: `InterfaceReq`,
    /// `NextHopAddressReq` and `MacAddressReq` are set.
    pub fn send_resolved(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        tracing::trace!(packet = packet.name(), "neighbour resolved");
        self.fragment_post_routing(packet, ctx, out)
    }

    /// Cache the default router Neighbour Discovery picked for `dest`.
    pub fn remember_next_hop(&mut self, dest: Ipv6Addr, next_hop: Ipv6Addr, interface: InterfaceId, now: SimTime) {
        tracing::trace!(dest = %dest, next_hop = %next_hop, interface = %interface, "default router cached");
        self.dest_cache.insert(
            dest,
            DestinationEntry {
                next_hop,
                interface,
                expires: now + self.cache_lifetime,
            },
        );
    }

    /// Neighbour Discovery gave up on a datagram. Without an interface it
    /// never found a default router.
    pub fn neighbour_unreachable(&mut self, packet: Packet, out: &mut Outbox) {
        let code = if packet.find_tag::<InterfaceReq>().is_some() {
            self.stats.dropped.record(DropReason::AddressResolutionFailed);
            unreachable_v6::ADDRESS_UNREACHABLE
        } else {
            self.stats.unroutable += 1;
            self.stats.dropped.record(DropReason::NoRouteFound);
            unreachable_v6::NO_ROUTE
        };
        Self::icmp_error(packet, Icmpv6Type::DestinationUnreachable, code, 0, out);
    }

    // ── From the upper layers ────────────────────────────────────────────────

    /// A transport packet carrying `L3AddressReq` and `PacketProtocolTag`.
    pub fn handle_from_upper(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        self.stats.sent_from_upper += 1;
        if ctx.interfaces.is_empty() {
            self.drop_packet(&packet, DropReason::NoInterfaceFound);
            return Ok(());
        }
        self.encapsulate(&mut packet, ctx.interfaces)?;

        let header = packet.peek_at_front::<Ipv6Header>()?;
        if !header.dest.is_multicast() && ctx.interfaces.is_local_address_v6(header.dest) {
            if header.src.is_unspecified() {
                let mut header = packet.remove_at_front::<Ipv6Header>()?;
                header.src = header.dest;
                packet.insert_at_front(Chunk::fields(header))?;
            }
            let keep = packet
                .find_tag::<InterfaceReq>()
                .and_then(|t| ctx.interfaces.get(t.0))
                .is_some_and(|i| i.loopback);
            if !keep {
                packet.set_tag(InterfaceReq(LOOPBACK_ID));
            }
        }
        if let Some(packet) = self.run_hooks(HookPoint::LocalOut, packet) {
            self.datagram_local_out(packet, ctx, out)?;
        }
        Ok(())
    }

    fn encapsulate(&mut self, packet: &mut Packet, interfaces: &InterfaceTable) -> Result<(), EngineError> {
        let request = packet
            .remove_tag_if_present::<L3AddressReq>()
            .ok_or(PacketError::MissingTag("L3AddressReq"))?;
        let IpAddr::V6(dest) = request.dest else {
            return Err(EngineError::WrongFamily(request.dest));
        };
        let src = match request.src {
            IpAddr::V6(src) => src,
            IpAddr::V4(src) if src.is_unspecified() => Ipv6Addr::UNSPECIFIED,
            other => return Err(EngineError::WrongFamily(other)),
        };
        if !src.is_unspecified() && !request.non_local_src && !interfaces.is_local_address_v6(src) {
            return Err(EngineError::NonLocalSource(IpAddr::V6(src)));
        }
        // Indications from a received packet must not travel back down.
        packet.remove_tag_if_present::<InterfaceInd>();

        let transport = packet.get_tag::<PacketProtocolTag>()?.0;
        let mut header = Ipv6Header {
            protocol: ip_protocol_number(transport).unwrap_or(0),
            src,
            dest,
            hop_limit: self.default_hop_limit,
            ..Ipv6Header::default()
        };

        if let Some(TosReq(tos)) = packet.remove_tag_if_present::<TosReq>() {
            if packet.find_tag::<DscpReq>().is_some() || packet.find_tag::<EcnReq>().is_some() {
                return Err(EngineError::TosConflict);
            }
            header.traffic_class = tos;
            packet.set_tag(TosInd(tos));
        }
        if let Some(DscpReq(dscp)) = packet.remove_tag_if_present::<DscpReq>() {
            header.set_dscp(dscp);
            packet.set_tag(DscpInd(header.dscp()));
        }
        if let Some(EcnReq(ecn)) = packet.remove_tag_if_present::<EcnReq>() {
            header.set_ecn(ecn);
            packet.set_tag(EcnInd(header.ecn()));
        }
        if let Some(HopLimitReq(limit)) = packet.remove_tag_if_present::<HopLimitReq>() {
            header.hop_limit = limit;
        }
        if let Some(Ipv6ExtHeaderReq(extensions)) = packet.remove_tag_if_present::<Ipv6ExtHeaderReq>() {
            for extension in extensions {
                header.add_extension_header(extension);
            }
        }

        header.payload_length =
            u16::try_from(header.header_length() - IPV6_HEADER_LENGTH + packet.data_length())
                .map_err(|_| EngineError::Unfragmentable("payload exceeds 65535 bytes"))?;
        packet.insert_at_front(Chunk::fields(header))?;
        packet.set_tag(PacketProtocolTag(protocol::IPV6));
        packet.remove_tag_if_present::<DispatchProtocolReq>();
        Ok(())
    }

    fn datagram_local_out(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let interfaces = ctx.interfaces;
        let dest = packet.peek_at_front::<Ipv6Header>()?.dest;
        let multicast = packet.find_tag::<MulticastReq>().copied().unwrap_or_default();
        let requested = multicast
            .interface
            .or_else(|| packet.find_tag::<InterfaceReq>().map(|t| t.0));
        tracing::trace!(packet = packet.name(), dest = %dest, "sending datagram");

        if !dest.is_multicast() {
            return self.route_unicast(packet, None, ctx, out);
        }

        self.stats.multicast += 1;
        if multicast.multicast_loop && interfaces.get(LOOPBACK_ID).is_some() {
            let mut copy = packet.dup();
            copy.set_tag(InterfaceReq(LOOPBACK_ID));
            copy.set_tag(NextHopAddressReq(IpAddr::V6(dest)));
            self.fragment_post_routing(copy, ctx, out)?;
        }
        let targets: Vec<InterfaceId> = match requested {
            Some(id) => vec![id],
            None => interfaces
                .iter()
                .filter(|i| !i.loopback)
                .map(|i| i.id)
                .collect(),
        };
        if targets.is_empty() {
            self.stats.unroutable += 1;
            self.drop_packet(&packet, DropReason::NoInterfaceFound);
            return Ok(());
        }
        for id in targets {
            let mut copy = packet.dup();
            copy.set_tag(InterfaceReq(id));
            copy.set_tag(NextHopAddressReq(IpAddr::V6(dest)));
            self.resolve_and_send(copy, ctx, out)?;
        }
        Ok(())
    }

    // ── Egress ───────────────────────────────────────────────────────────────

    fn fragment_post_routing(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = ctx
            .interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        let header = packet.peek_at_front::<Ipv6Header>()?;
        // Solicitations during duplicate address detection go out unspecified.
        if header.src.is_unspecified() && !header.dest.is_solicited_node_multicast() {
            if let Some(src) = iface.source_for_v6(header.dest) {
                let mut header = packet.remove_at_front::<Ipv6Header>()?;
                header.src = src;
                packet.insert_at_front(Chunk::fields(header))?;
            }
        }
        if let Some(packet) = self.run_hooks(HookPoint::PostRouting, packet) {
            self.fragment_and_send(packet, ctx, out)?;
        }
        Ok(())
    }

    fn fragment_and_send(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = ctx
            .interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        let header = packet.peek_at_front::<Ipv6Header>()?;
        let forwarded = packet.find_tag::<InterfaceInd>().is_some();

        if header.hop_limit == 0 {
            tracing::warn!(packet = packet.name(), "hop limit reached zero");
            self.stats.dropped.record(DropReason::HopLimitReached);
            Self::icmp_error(
                packet,
                Icmpv6Type::TimeExceeded,
                time_exceeded_v6::HOP_LIMIT_EXCEEDED,
                0,
                out,
            );
            return Ok(());
        }

        if !forwarded && ctx.interfaces.is_tentative_v6(header.src) {
            tracing::debug!(packet = packet.name(), src = %header.src, "source address tentative, requeueing");
            self.stats.tentative_requeued += 1;
            self.tentative.push(TentativeDatagram {
                packet,
                retries: 0,
                next_retry: ctx.now + TENTATIVE_RETRY,
            });
            return Ok(());
        }

        let mtu = iface.mtu;
        if mtu == 0 || packet.data_length() <= mtu {
            Self::send_to_nic(packet, iface, out);
            return Ok(());
        }

        if forwarded {
            tracing::debug!(packet = packet.name(), mtu, "forwarded datagram too big");
            self.stats.dropped.record(DropReason::Other);
            Self::icmp_error(
                packet,
                Icmpv6Type::PacketTooBig,
                0,
                u32::try_from(mtu).unwrap_or(u32::MAX),
                out,
            );
            return Ok(());
        }
        self.fragment(packet, iface, out)
    }

    /// Split a local datagram behind its unfragmentable part. Fragmentable
    /// extension headers travel as payload of the first fragment.
    fn fragment(&mut self, packet: Packet, iface: &NetworkInterface, out: &mut Outbox) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv6Header>()?;
        let unfragmentable = header.unfragmentable_length();
        let payload_length = packet.data_length() - unfragmentable;
        let mtu = iface.mtu;
        let fragment_length = mtu.saturating_sub(unfragmentable + FRAGMENT_HEADER_LENGTH) / 8 * 8;
        if fragment_length == 0 {
            return Err(EngineError::MtuTooSmall {
                interface: iface.name.clone(),
                mtu,
                header_length: unfragmentable + FRAGMENT_HEADER_LENGTH,
            });
        }

        let mut base = header.clone();
        base.protocol = header
            .extension_headers
            .iter()
            .find(|h| !h.is_unfragmentable())
            .map_or(header.protocol, Ipv6ExtensionHeader::header_type);
        base.extension_headers.retain(Ipv6ExtensionHeader::is_unfragmentable);

        let identification = self.identification;
        self.identification = self.identification.wrapping_add(1);
        let count = payload_length.div_ceil(fragment_length);
        tracing::debug!(packet = packet.name(), fragments = count, mtu, "fragmenting datagram");

        let mut offset = 0;
        while offset < payload_length {
            let last = offset + fragment_length >= payload_length;
            let this_length = if last {
                payload_length - offset
            } else {
                fragment_length
            };
            let mut fragment_header = base.clone();
            fragment_header.add_extension_header(Ipv6ExtensionHeader::Fragment {
                fragment_offset: u16::try_from(offset)
                    .map_err(|_| EngineError::Unfragmentable("fragment offset exceeds 16 bits"))?,
                more_fragments: !last,
                identification,
            });
            fragment_header.payload_length =
                u16::try_from(fragment_header.header_length() - IPV6_HEADER_LENGTH + this_length)
                    .map_err(|_| EngineError::Unfragmentable("fragment exceeds 65535 bytes"))?;

            let name = if last {
                format!("{}-frag-{offset}-last", packet.name())
            } else {
                format!("{}-frag-{offset}", packet.name())
            };
            let data = packet.peek_data_at(unfragmentable + offset, this_length)?;
            let mut fragment = Packet::with_chunk(name, data);
            fragment.tags.copy_from(&packet.tags);
            fragment.insert_at_front(Chunk::fields(fragment_header))?;
            self.stats.fragments_created += 1;
            Self::send_to_nic(fragment, iface, out);
            offset += this_length;
        }
        Ok(())
    }

    fn send_to_nic(mut packet: Packet, iface: &NetworkInterface, out: &mut Outbox) {
        packet.remove_tag_if_present::<NextHopAddressReq>();
        packet.remove_tag_if_present::<DispatchProtocolReq>();
        packet.set_tag(InterfaceReq(iface.id));
        packet.set_tag(PacketProtocolTag(protocol::IPV6));
        if iface.loopback {
            packet.remove_tag_if_present::<MacAddressReq>();
        } else {
            packet.add_tag_if_absent(MacAddressReq {
                src: iface.mac,
                dest: MacAddress::BROADCAST,
            });
        }
        tracing::trace!(packet = packet.name(), interface = %iface.name, "to link layer");
        out.push(Emit::ToLink(packet));
    }

    // ── Local delivery ───────────────────────────────────────────────────────

    fn local_deliver(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv6Header>()?;
        let packet = match header.fragment_header() {
            Some((offset, more_fragments, identification)) => {
                self.maybe_purge(ctx.now, out);
                let header_length = header.header_length();
                let payload = packet.peek_data_at(header_length, packet.data_length() - header_length)?;
                let key = FragmentKey {
                    src: header.src,
                    dest: header.dest,
                    identification,
                };
                let fragment = Fragment {
                    offset: usize::from(offset),
                    more_fragments,
                    header,
                    payload,
                    packet,
                };
                let Some(done) = self.fragments.add_fragment(key, fragment, ctx.now) else {
                    return Ok(());
                };
                self.rebuild(done)?
            }
            None => packet,
        };

        if let Some(packet) = self.run_hooks(HookPoint::LocalIn, packet) {
            self.local_deliver_finish(packet, out)?;
        }
        Ok(())
    }

    /// Serialize the reassembled datagram so extension headers that
    /// travelled as fragment payload are parsed again.
    fn rebuild(&mut self, done: Reassembled<Ipv6Header>) -> Result<Packet, EngineError> {
        let mut header = done.header;
        header.remove_fragment_header();
        header.payload_length =
            u16::try_from(header.header_length() - IPV6_HEADER_LENGTH + done.payload_length)
                .map_err(|_| EngineError::Unfragmentable("reassembled datagram exceeds 65535 bytes"))?;

        let mut bytes = BytesMut::with_capacity(header.header_length() + done.payload_length);
        bytes.extend_from_slice(&Chunk::fields(header).to_bytes());
        for piece in &done.payload {
            bytes.extend_from_slice(&piece.to_bytes());
        }
        let mut whole = Packet::with_chunk(done.first.name(), Chunk::bytes(bytes.freeze()));
        whole.tags = done.first.tags;
        let header = whole.peek_at_front::<Ipv6Header>()?;
        whole.set_tag(NetworkProtocolInd {
            protocol: protocol::IPV6,
            header: Chunk::fields(header),
        });
        self.stats.reassembled += 1;
        Ok(whole)
    }

    fn local_deliver_finish(&mut self, mut packet: Packet, out: &mut Outbox) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv6Header>()?;

        for extension in &header.extension_headers {
            let mobility = match extension {
                Ipv6ExtensionHeader::Routing { routing_type, .. } => *routing_type == 2,
                Ipv6ExtensionHeader::DestinationOptions { options } => {
                    options.iter().any(|o| o.kind() == OPTION_HOME_ADDRESS)
                }
                _ => false,
            };
            if mobility {
                tracing::debug!(packet = packet.name(), header = extension.header_type(), "diverting to mobility");
                self.stats.to_mobility += 1;
                out.push(Emit::ToMobility(packet));
                return Ok(());
            }
            tracing::trace!(header = extension.header_type(), "ignoring extension header");
        }

        let header_at = packet.front_offset();
        packet.pop_at_front::<Ipv6Header>()?;
        let transport = IP_PROTOCOLS.find_protocol(u16::from(header.protocol));
        let (local, remote) = (IpAddr::V6(header.dest), IpAddr::V6(header.src));
        Self::decapsulate(&mut packet, &header, transport);

        let sockets = transport
            .map(|p| self.sockets.matching(p, local, remote))
            .unwrap_or_default();
        for socket in &sockets {
            let mut copy = packet.dup();
            copy.set_tag(SocketInd(*socket));
            tracing::trace!(socket = %socket, "passing up to raw socket");
            out.push(Emit::ToUpper(copy));
        }

        match transport {
            Some(p) if p == protocol::ICMPV6 && Self::is_neighbour_discovery(&packet) => {
                out.push(Emit::NeighbourDiscoveryMessage(packet));
            }
            Some(p) if p == protocol::MOBILE_IPV6 => {
                self.stats.to_mobility += 1;
                out.push(Emit::ToMobility(packet));
            }
            Some(p) if p == protocol::IPV4 || p == protocol::IPV6 => {
                tracing::debug!(packet = packet.name(), "tunnelled datagram");
                self.stats.tunnelled += 1;
                out.push(Emit::ToTunnel(packet));
            }
            Some(p) if self.upper_protocols.contains(&p) => {
                tracing::trace!(packet = packet.name(), protocol = %p, "delivering locally");
                self.stats.local_deliveries += 1;
                out.push(Emit::ToUpper(packet));
            }
            _ if !sockets.is_empty() => {}
            _ => {
                tracing::warn!(next_header = header.protocol, "unrecognized next header");
                packet.set_front_offset(header_at)?;
                self.stats.dropped.record(DropReason::NoProtocolFound);
                Self::icmp_error(
                    packet,
                    Icmpv6Type::ParameterProblem,
                    parameter_problem_v6::UNRECOGNIZED_NEXT_HEADER,
                    Self::next_header_pointer(&header),
                    out,
                );
            }
        }
        Ok(())
    }

    fn is_neighbour_discovery(packet: &Packet) -> bool {
        packet
            .peek_at_front::<Icmpv6Header>()
            .is_ok_and(|h| h.icmp_type.is_neighbour_discovery())
    }

    /// Offset of the next-header field that named the unknown protocol.
    fn next_header_pointer(header: &Ipv6Header) -> u32 {
        let pointer = match header.extension_headers.split_last() {
            None => 6,
            Some((_, before)) => {
                IPV6_HEADER_LENGTH + before.iter().map(Ipv6ExtensionHeader::length).sum::<usize>()
            }
        };
        u32::try_from(pointer).unwrap_or(u32::MAX)
    }

    fn decapsulate(packet: &mut Packet, header: &Ipv6Header, transport: Option<Protocol>) {
        packet.set_tag(DscpInd(header.dscp()));
        packet.set_tag(EcnInd(header.ecn()));
        packet.set_tag(TosInd(header.traffic_class));
        if let Some(transport) = transport {
            packet.set_tag(PacketProtocolTag(transport));
            packet.set_tag(DispatchProtocolReq::indication(transport));
        }
        packet.set_tag(L3AddressInd {
            src: IpAddr::V6(header.src),
            dest: IpAddr::V6(header.dest),
        });
        packet.set_tag(HopLimitInd(header.hop_limit));
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn maybe_purge(&mut self, now: SimTime, out: &mut Outbox) {
        if now < self.last_purge + PURGE_INTERVAL {
            return;
        }
        self.last_purge = now;
        let cutoff = now.saturating_sub(self.fragment_timeout);
        for first in self.fragments.purge(cutoff) {
            self.stats.dropped.record(DropReason::ReassemblyTimeout);
            Self::icmp_error(
                first,
                Icmpv6Type::TimeExceeded,
                time_exceeded_v6::REASSEMBLY_TIMEOUT,
                0,
                out,
            );
        }
    }

    /// Periodic housekeeping: tentative-source retries, fragment sweeps and
    /// destination-cache expiry. A held datagram that meets a too-small MTU
    /// is a configuration error and is returned after the sweep.
    pub fn tick(&mut self, ctx: &mut Ipv6Context<'_>, out: &mut Outbox) -> Result<(), EngineError> {
        let mut fatal = None;
        self.maybe_purge(ctx.now, out);
        let expired = self.dest_cache.purge(ctx.now);
        if expired > 0 {
            tracing::trace!(expired, "destination cache entries expired");
        }

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.tentative)
            .into_iter()
            .partition(|d| ctx.now >= d.next_retry);
        self.tentative = waiting;
        for mut datagram in due {
            let src = datagram
                .packet
                .peek_at_front::<Ipv6Header>()
                .map(|h| h.src)
                .unwrap_or(Ipv6Addr::UNSPECIFIED);
            if !ctx.interfaces.is_tentative_v6(src) {
                tracing::debug!(packet = datagram.packet.name(), src = %src, "source address preferred, sending");
                match self.fragment_and_send(datagram.packet, ctx, out) {
                    Err(e @ EngineError::MtuTooSmall { .. }) => {
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "sending held datagram failed");
                        self.stats.dropped.record(DropReason::Other);
                    }
                    Ok(()) => {}
                }
                continue;
            }
            datagram.retries += 1;
            if datagram.retries > self.tentative_retry_limit {
                tracing::warn!(packet = datagram.packet.name(), src = %src, "source address still tentative, giving up");
                self.stats.dropped.record(DropReason::TentativeAddress);
                continue;
            }
            datagram.next_retry = ctx.now + TENTATIVE_RETRY;
            self.tentative.push(datagram);
        }
        fatal.map_or(Ok(()), Err)
    }

    // ── Sockets, reinjection, lifecycle ──────────────────────────────────────

    pub fn handle_command(&mut self, command: &Command) -> Option<Command> {
        self.sockets.handle_command(command)
    }

    /// Resume a datagram a hook queued, right after the hook point it was
    /// queued at. Returns `false` for an unknown ticket.
    pub fn reinject(
        &mut self,
        ticket: QueueTicket,
        ctx: &mut Ipv6Context<'_>,
        out: &mut Outbox,
    ) -> Result<bool, EngineError> {
        let Some((point, packet)) = self.hooks.take_queued(ticket) else {
            return Ok(false);
        };
        tracing::debug!(?ticket, point = %point, "reinjecting datagram");
        match point {
            HookPoint::PreRouting => self.prerouting_finish(packet, ctx, out)?,
            HookPoint::LocalIn => self.local_deliver_finish(packet, out)?,
            HookPoint::LocalOut => self.datagram_local_out(packet, ctx, out)?,
            HookPoint::Forward => self.route_unicast_finish(packet, ctx, out)?,
            HookPoint::PostRouting => self.fragment_and_send(packet, ctx, out)?,
        }
        Ok(true)
    }

    pub fn drop_queued(&mut self, ticket: QueueTicket) -> bool {
        let dropped = self.hooks.drop_queued(ticket);
        if dropped {
            self.stats.dropped.record(DropReason::Filtered);
        }
        dropped
    }

    /// Discard all parked state.
    pub fn stop(&mut self) {
        let queued = self.hooks.flush();
        let fragments = self.fragments.len();
        let tentative = self.tentative.len();
        self.fragments.clear();
        self.tentative.clear();
        self.dest_cache.clear();
        self.sockets.clear();
        tracing::info!(queued, fragments, tentative, "ipv6 stopped");
    }
}
