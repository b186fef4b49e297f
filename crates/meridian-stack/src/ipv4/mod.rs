//! IPv4 engine: header validation, routing, fragmentation, reassembly and
//! delivery.
//!
//! ```text
//!  lower ─▶ verify ─▶ PREROUTING ─┬─▶ local ──▶ reassemble ─▶ LOCALIN ─▶ upper
//!                                 ├─▶ multicast ─▶ replicate ─┐
//!                                 └─▶ unicast ─▶ FORWARD ─────┤
//!  upper ─▶ encapsulate ─▶ LOCALOUT ─▶ route ─────────────────┴▶ POSTROUTING
//!                                           ─▶ fragment ─▶ ARP ─▶ link
//! ```
//!
//! Every stage takes the packet by value and either passes it on, parks it
//! (hook queue, ARP queue, fragment buffer) or drops it with a counted
//! reason. Anything addressed elsewhere comes out of the engine as an
//! `Emit` in the caller's outbox.

mod pending;

pub use pending::PendingQueues;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rand::{Rng, RngCore};
use serde::Serialize;

use meridian_core::address::Ipv4AddrExt;
use meridian_core::config::Ipv4Config;
use meridian_core::protocol::{self, ip_protocol_number, IP_PROTOCOLS};
use meridian_core::tags::{
    DispatchProtocolReq, DscpInd, DscpReq, EcnInd, EcnReq, FragmentationReq, HopLimitInd,
    HopLimitReq, InterfaceInd, InterfaceReq, Ipv4OptionsReq, L3AddressInd, L3AddressReq,
    MacAddressReq, MulticastReq, NetworkProtocolInd, NextHopAddressReq, PacketProtocolTag,
    SocketInd, TosInd, TosReq,
};
use meridian_core::wire::icmp::{time_exceeded, unreachable, IcmpType};
use meridian_core::wire::ipv4::Ipv4Header;
use meridian_core::{
    Chunk, CrcMode, InterfaceId, MacAddress, Packet, PacketError, PeekFlags, Protocol, SimTime,
};

use crate::dispatcher::Command;
use crate::interface::{matches_glob_list, InterfaceTable, NetworkInterface, LOOPBACK_ID};
use crate::netfilter::{HookChain, HookOutcome, HookPoint, QueueTicket};
use crate::outbox::{Emit, Outbox};
use crate::raw_socket::RawSocketTable;
use crate::reassembly::{Fragment, ReassemblyBuffer};
use crate::resolver::AddressResolver;
use crate::routing::Ipv4RoutingTable;
use crate::stats::{DropCounters, DropReason};
use crate::EngineError;

/// Minimum spacing between sweeps of the fragment buffer.
const PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// Collaborators the engine borrows for the duration of one call.
pub struct Ipv4Context<'a> {
    pub interfaces: &'a InterfaceTable,
    pub routes: &'a dyn Ipv4RoutingTable,
    pub arp: &'a mut dyn AddressResolver,
    /// Source of the header bit-error draw.
    pub rng: &'a mut dyn RngCore,
    pub now: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dest: Ipv4Addr,
    identification: u16,
    protocol: u8,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Ipv4Stats {
    pub received: u64,
    pub sent_from_upper: u64,
    pub forwarded: u64,
    pub local_deliveries: u64,
    pub multicast: u64,
    pub unroutable: u64,
    pub fragments_created: u64,
    pub reassembled: u64,
    pub dropped: DropCounters,
}

#[derive(Debug)]
pub struct Ipv4 {
    crc_mode: CrcMode,
    default_ttl: u8,
    default_multicast_ttl: u8,
    fragment_timeout: Duration,
    limited_broadcast: bool,
    direct_broadcast_interfaces: String,
    identification: u16,
    hooks: HookChain,
    fragments: ReassemblyBuffer<FragmentKey, Ipv4Header>,
    last_purge: SimTime,
    pending: PendingQueues,
    sockets: RawSocketTable,
    upper_protocols: HashSet<Protocol>,
    pub stats: Ipv4Stats,
}

impl Ipv4 {
    pub fn new(config: &Ipv4Config) -> Self {
        Self {
            crc_mode: config.crc_mode,
            default_ttl: config.default_ttl,
            default_multicast_ttl: config.default_multicast_ttl,
            fragment_timeout: Duration::from_secs(config.fragment_timeout_secs),
            limited_broadcast: config.limited_broadcast,
            direct_broadcast_interfaces: config.direct_broadcast_interfaces.clone(),
            identification: 0,
            hooks: HookChain::new(),
            fragments: ReassemblyBuffer::new(),
            last_purge: SimTime::ZERO,
            pending: PendingQueues::new(),
            sockets: RawSocketTable::new(),
            upper_protocols: HashSet::new(),
            stats: Ipv4Stats::default(),
        }
    }

    pub fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookChain {
        &mut self.hooks
    }

    pub fn pending(&self) -> &PendingQueues {
        &self.pending
    }

    pub fn raw_sockets(&self) -> &RawSocketTable {
        &self.sockets
    }

    /// Fragmented datagrams still waiting for pieces.
    pub fn fragments_outstanding(&self) -> usize {
        self.fragments.len()
    }

    /// Transport protocols that have a handler above this engine.
    pub fn register_upper_protocol(&mut self, protocol: Protocol) {
        tracing::debug!(protocol = %protocol, "ipv4 upper protocol registered");
        self.upper_protocols.insert(protocol);
    }

    fn drop_packet(&mut self, packet: &Packet, reason: DropReason) {
        tracing::debug!(packet = packet.name(), reason = %reason, "ipv4 dropped");
        self.stats.dropped.record(reason);
    }

    /// Run a hook point. `Some` means every hook accepted.
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

    fn icmp_error(packet: Packet, icmp_type: IcmpType, code: u8, value: u32, out: &mut Outbox) {
        out.push(Emit::Icmpv4Error {
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
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        self.stats.received += 1;
        packet.get_tag::<InterfaceInd>()?;
        packet.trim();

        let peeked = match packet.peek_at_with::<Ipv4Header>(0, PeekFlags::ALLOW_INCORRECT) {
            Ok(peeked) => peeked,
            Err(e) => {
                tracing::debug!(packet = packet.name(), error = %e, "unparseable ipv4 header");
                self.drop_packet(&packet, DropReason::Malformed);
                return Ok(());
            }
        };
        let header = peeked.header;
        packet.set_tag(NetworkProtocolInd {
            protocol: protocol::IPV4,
            header: Chunk::fields(header.clone()),
        });

        if !self.verify_crc(&header, peeked.correct) {
            tracing::warn!(packet = packet.name(), "ipv4 header checksum error");
            self.drop_packet(&packet, DropReason::IncorrectlyReceived);
            return Ok(());
        }

        let total = usize::from(header.total_length);
        if total > packet.data_length() || total < header.header_length() {
            tracing::warn!(
                packet = packet.name(),
                total_length = total,
                buffered = packet.data_length(),
                "ipv4 length error"
            );
            self.stats.dropped.record(DropReason::Malformed);
            Self::icmp_error(packet, IcmpType::ParameterProblem, 0, 0, out);
            return Ok(());
        }
        if total < packet.data_length() {
            packet.set_back_offset(packet.front_offset() + total)?;
            packet.trim();
        }

        if packet.bit_error {
            // Only a bit error inside the header is detected here.
            let in_header = header.header_length() as f64 / total as f64;
            if ctx.rng.gen::<f64>() <= in_header {
                tracing::warn!(packet = packet.name(), "bit error in ipv4 header");
                self.stats.dropped.record(DropReason::IncorrectlyReceived);
                Self::icmp_error(packet, IcmpType::ParameterProblem, 0, 0, out);
                return Ok(());
            }
        }

        tracing::trace!(packet = packet.name(), dest = %header.dest, "ipv4 received");
        if let Some(packet) = self.run_hooks(HookPoint::PreRouting, packet) {
            self.prerouting_finish(packet, ctx, out)?;
        }
        Ok(())
    }

    fn verify_crc(&self, header: &Ipv4Header, correct: bool) -> bool {
        match header.crc_mode {
            CrcMode::Disabled => true,
            CrcMode::DeclaredCorrect => correct,
            CrcMode::DeclaredIncorrect => false,
            CrcMode::Computed => correct && header.computed_crc_ok(),
        }
    }

    fn prerouting_finish(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let interfaces = ctx.interfaces;
        let from = packet.get_tag::<InterfaceInd>()?.0;
        let from_if = interfaces
            .get(from)
            .ok_or(EngineError::UnknownInterface(from))?;
        let header = packet.peek_at_front::<Ipv4Header>()?;
        let dest = header.dest;

        if from_if.loopback {
            return self.reassemble_and_deliver(packet, ctx, out);
        }

        if dest.is_multicast() {
            let is_igmp = IP_PROTOCOLS.find_protocol(u16::from(header.protocol)) == Some(protocol::IGMP);
            let multicast_router = ctx.routes.is_multicast_forwarding_enabled();
            if from_if.is_member_v4(dest) || (is_igmp && multicast_router) {
                self.reassemble_and_deliver(packet.dup(), ctx, out)?;
            }
            if !multicast_router {
                tracing::trace!(group = %dest, "multicast forwarding disabled");
            } else if dest.is_link_local_multicast() {
                tracing::trace!(group = %dest, "link-local multicast not forwarded");
            } else if header.ttl <= 1 {
                tracing::trace!(group = %dest, "multicast ttl exhausted");
            } else {
                let packet = Self::prepare_for_forwarding(packet)?;
                self.forward_multicast(packet, from, ctx, out)?;
            }
            return Ok(());
        }

        if interfaces.is_local_address_v4(dest) || from_if.ipv4.is_none() {
            return self.reassemble_and_deliver(packet, ctx, out);
        }

        if dest.is_broadcast() || interfaces.is_local_broadcast_v4(dest) {
            let target = interfaces.interface_by_broadcast_v4(dest);
            if let Some(target) = target {
                if target.id != from
                    && ctx.routes.is_forwarding_enabled()
                    && (matches_glob_list(&self.direct_broadcast_interfaces, &target.name)
                        || matches_glob_list(&self.direct_broadcast_interfaces, &target.full_path))
                {
                    let mut copy = Self::prepare_for_forwarding(packet.dup())?;
                    copy.set_tag(InterfaceReq(target.id));
                    copy.set_tag(NextHopAddressReq(IpAddr::V4(Ipv4Addr::BROADCAST)));
                    tracing::debug!(interface = %target.name, "rebroadcasting directed broadcast");
                    self.fragment_post_routing(copy, ctx, out)?;
                }
            }
            return self.reassemble_and_deliver(packet, ctx, out);
        }

        if !ctx.routes.is_forwarding_enabled() {
            self.drop_packet(&packet, DropReason::ForwardingDisabled);
            return Ok(());
        }
        let packet = Self::prepare_for_forwarding(packet)?;
        self.route_unicast(packet, Some(from), ctx, out)
    }

    /// Decrement the TTL in place.
    fn prepare_for_forwarding(mut packet: Packet) -> Result<Packet, EngineError> {
        let mut header = packet.remove_at_front::<Ipv4Header>()?;
        header.ttl = header.ttl.saturating_sub(1);
        packet.insert_at_front(Chunk::fields(header))?;
        Ok(packet)
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    fn route_unicast(
        &mut self,
        mut packet: Packet,
        from: Option<InterfaceId>,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv4Header>()?;
        let dest = header.dest;
        let requested = packet.find_tag::<InterfaceReq>().map(|t| t.0);

        match requested {
            Some(id) => {
                let iface = ctx
                    .interfaces
                    .get(id)
                    .ok_or(EngineError::UnknownInterface(id))?;
                let has_next_hop = packet
                    .find_tag::<NextHopAddressReq>()
                    .is_some_and(|t| !t.0.is_unspecified());
                if !has_next_hop && iface.broadcast {
                    if let Some(route) = ctx.routes.best_matching_route(dest) {
                        if route.interface == id {
                            packet.set_tag(NextHopAddressReq(IpAddr::V4(route.gateway)));
                        }
                    }
                }
            }
            None => match ctx.routes.best_matching_route(dest) {
                Some(route) => {
                    tracing::trace!(dest = %dest, gateway = %route.gateway, interface = %route.interface, "route found");
                    packet.set_tag(InterfaceReq(route.interface));
                    packet.set_tag(NextHopAddressReq(IpAddr::V4(route.gateway)));
                }
                None => {
                    tracing::debug!(dest = %dest, "no route");
                    self.stats.unroutable += 1;
                    self.stats.dropped.record(DropReason::NoRouteFound);
                    Self::icmp_error(
                        packet,
                        IcmpType::DestinationUnreachable,
                        unreachable::NET,
                        0,
                        out,
                    );
                    return Ok(());
                }
            },
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

    fn route_unicast_finish(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        if packet.find_tag::<InterfaceInd>().is_some() {
            self.stats.forwarded += 1;
        }
        self.fragment_post_routing(packet, ctx, out)
    }

    fn route_local_broadcast(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let all_ones = NextHopAddressReq(IpAddr::V4(Ipv4Addr::BROADCAST));
        if packet.find_tag::<InterfaceReq>().is_some() {
            packet.set_tag(all_ones);
            return self.fragment_post_routing(packet, ctx, out);
        }
        if !self.limited_broadcast {
            tracing::debug!(packet = packet.name(), "broadcast without interface");
            self.drop_packet(&packet, DropReason::NoInterfaceFound);
            return Ok(());
        }
        let dest = packet.peek_at_front::<Ipv4Header>()?.dest;
        let targets: Vec<InterfaceId> = ctx
            .interfaces
            .iter()
            .filter(|i| !i.loopback)
            .filter(|i| {
                dest.is_broadcast()
                    || i.ipv4.as_ref().is_some_and(|d| d.broadcast() == dest)
            })
            .map(|i| i.id)
            .collect();
        for id in targets {
            let mut copy = packet.dup();
            copy.set_tag(InterfaceReq(id));
            copy.set_tag(all_ones);
            self.fragment_post_routing(copy, ctx, out)?;
        }
        Ok(())
    }

    fn forward_multicast(
        &mut self,
        packet: Packet,
        from: InterfaceId,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv4Header>()?;
        let (src, group) = (header.src, header.dest);
        self.stats.multicast += 1;

        let Some(route) = ctx.routes.best_multicast_route(src, group).cloned() else {
            tracing::debug!(src = %src, group = %group, "no multicast route");
            self.stats.unroutable += 1;
            self.drop_packet(&packet, DropReason::NoRouteFound);
            return Ok(());
        };
        let expected = route
            .input_interface
            .or_else(|| ctx.routes.best_matching_route(src).map(|r| r.interface));
        if expected != Some(from) {
            tracing::debug!(src = %src, group = %group, from = %from, "reverse path check failed");
            self.drop_packet(&packet, DropReason::Other);
            return Ok(());
        }

        self.stats.forwarded += 1;
        for output in route.outputs.iter().filter(|o| o.interface != from) {
            let Some(iface) = ctx.interfaces.get(output.interface) else {
                continue;
            };
            if header.ttl <= output.ttl_threshold {
                tracing::trace!(interface = %iface.name, "below multicast ttl threshold");
                continue;
            }
            if output.leaf && !iface.is_member_v4(group) {
                tracing::trace!(interface = %iface.name, "leaf without listener");
                continue;
            }
            let mut copy = packet.dup();
            copy.set_tag(InterfaceReq(output.interface));
            copy.set_tag(NextHopAddressReq(IpAddr::V4(group)));
            self.fragment_post_routing(copy, ctx, out)?;
        }
        Ok(())
    }

    /// Egress for self-originated multicast: socket option, routing table,
    /// interface owning the source address, first multicast interface.
    fn multicast_interface(
        header: &Ipv4Header,
        requested: Option<InterfaceId>,
        ctx: &Ipv4Context<'_>,
    ) -> Option<InterfaceId> {
        requested
            .or_else(|| ctx.routes.best_matching_route(header.dest).map(|r| r.interface))
            .or_else(|| ctx.interfaces.interface_by_address_v4(header.src).map(|i| i.id))
            .or_else(|| ctx.interfaces.first_multicast_interface().map(|i| i.id))
    }

    // ── From the upper layers ────────────────────────────────────────────────

    /// A transport packet carrying `L3AddressReq` and `PacketProtocolTag`.
    pub fn handle_from_upper(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        self.stats.sent_from_upper += 1;
        if ctx.interfaces.is_empty() {
            self.drop_packet(&packet, DropReason::NoInterfaceFound);
            return Ok(());
        }
        self.encapsulate(&mut packet, ctx.interfaces)?;
        if let Some(packet) = self.run_hooks(HookPoint::LocalOut, packet) {
            self.datagram_local_out(packet, ctx, out)?;
        }
        Ok(())
    }

    fn encapsulate(&mut self, packet: &mut Packet, interfaces: &InterfaceTable) -> Result<(), EngineError> {
        let request = packet
            .remove_tag_if_present::<L3AddressReq>()
            .ok_or(PacketError::MissingTag("L3AddressReq"))?;
        let IpAddr::V4(dest) = request.dest else {
            return Err(EngineError::WrongFamily(request.dest));
        };
        let src = match request.src {
            IpAddr::V4(src) => src,
            IpAddr::V6(src) if src.is_unspecified() => Ipv4Addr::UNSPECIFIED,
            other => return Err(EngineError::WrongFamily(other)),
        };
        if !src.is_unspecified() && !request.non_local_src && !interfaces.is_local_address_v4(src) {
            return Err(EngineError::NonLocalSource(IpAddr::V4(src)));
        }
        packet.remove_tag_if_present::<InterfaceInd>();

        let transport = packet.get_tag::<PacketProtocolTag>()?.0;
        let mut header = Ipv4Header {
            protocol: ip_protocol_number(transport).unwrap_or(0),
            src,
            dest,
            ..Ipv4Header::default()
        };

        if let Some(TosReq(tos)) = packet.remove_tag_if_present::<TosReq>() {
            if packet.find_tag::<DscpReq>().is_some() || packet.find_tag::<EcnReq>().is_some() {
                return Err(EngineError::TosConflict);
            }
            header.tos = tos;
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

        header.identification = self.identification;
        self.identification = self.identification.wrapping_add(1);
        header.dont_fragment = packet
            .remove_tag_if_present::<FragmentationReq>()
            .is_some_and(|f| f.dont_fragment);

        header.ttl = match packet.remove_tag_if_present::<HopLimitReq>() {
            Some(HopLimitReq(ttl)) => ttl,
            None if dest.is_link_local_multicast() => 1,
            None if dest.is_multicast() => self.default_multicast_ttl,
            None => self.default_ttl,
        };

        if let Some(Ipv4OptionsReq(options)) = packet.remove_tag_if_present::<Ipv4OptionsReq>() {
            header.options = options;
        }
        header.validate()?;

        header.total_length = u16::try_from(header.header_length() + packet.data_length())
            .map_err(|_| EngineError::Unfragmentable("datagram exceeds 65535 bytes"))?;
        header.crc_mode = self.crc_mode;
        header.crc = self.crc_mode.sentinel();

        packet.insert_at_front(Chunk::fields(header))?;
        packet.set_tag(PacketProtocolTag(protocol::IPV4));
        packet.remove_tag_if_present::<DispatchProtocolReq>();
        Ok(())
    }

    fn datagram_local_out(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let interfaces = ctx.interfaces;
        let header = packet.peek_at_front::<Ipv4Header>()?;
        let dest = header.dest;
        let multicast = packet.find_tag::<MulticastReq>().copied().unwrap_or_default();
        let requested = multicast
            .interface
            .or_else(|| packet.find_tag::<InterfaceReq>().map(|t| t.0));

        tracing::trace!(packet = packet.name(), dest = %dest, "sending datagram");

        if dest.is_multicast() {
            let egress = Self::multicast_interface(&header, requested, ctx);
            let egress_is_loopback = egress
                .and_then(|id| interfaces.get(id))
                .is_some_and(|i| i.loopback);
            if multicast.multicast_loop && !egress_is_loopback && interfaces.get(LOOPBACK_ID).is_some() {
                let mut copy = packet.dup();
                copy.set_tag(InterfaceReq(LOOPBACK_ID));
                copy.set_tag(NextHopAddressReq(IpAddr::V4(dest)));
                self.fragment_post_routing(copy, ctx, out)?;
            }
            return match egress {
                Some(id) => {
                    self.stats.multicast += 1;
                    packet.set_tag(InterfaceReq(id));
                    packet.set_tag(NextHopAddressReq(IpAddr::V4(dest)));
                    self.fragment_post_routing(packet, ctx, out)
                }
                None => {
                    self.stats.unroutable += 1;
                    self.drop_packet(&packet, DropReason::NoInterfaceFound);
                    Ok(())
                }
            };
        }

        if interfaces.is_local_address_v4(dest) {
            let keep = requested
                .and_then(|id| interfaces.get(id))
                .is_some_and(|i| i.loopback);
            if !keep {
                packet.set_tag(InterfaceReq(LOOPBACK_ID));
            }
            packet.set_tag(NextHopAddressReq(IpAddr::V4(dest)));
            return self.route_unicast(packet, None, ctx, out);
        }

        if dest.is_broadcast() || interfaces.is_local_broadcast_v4(dest) {
            return self.route_local_broadcast(packet, ctx, out);
        }
        self.route_unicast(packet, None, ctx, out)
    }

    // ── Egress ───────────────────────────────────────────────────────────────

    fn fragment_post_routing(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = ctx
            .interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        if packet.peek_at_front::<Ipv4Header>()?.src.is_unspecified() {
            let mut header = packet.remove_at_front::<Ipv4Header>()?;
            header.src = iface.ipv4_address().unwrap_or(Ipv4Addr::UNSPECIFIED);
            packet.insert_at_front(Chunk::fields(header))?;
        }
        if let Some(packet) = self.run_hooks(HookPoint::PostRouting, packet) {
            self.fragment_and_send(packet, ctx, out)?;
        }
        Ok(())
    }

    fn fragment_and_send(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = ctx
            .interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        let header = packet.peek_at_front::<Ipv4Header>()?;
        let next_hop_unset = packet
            .find_tag::<NextHopAddressReq>()
            .map_or(true, |t| t.0.is_unspecified());
        if next_hop_unset {
            packet.set_tag(NextHopAddressReq(IpAddr::V4(header.dest)));
        }

        if header.ttl == 0 {
            tracing::warn!(packet = packet.name(), "ttl reached zero");
            self.stats.dropped.record(DropReason::HopLimitReached);
            Self::icmp_error(
                packet,
                IcmpType::TimeExceeded,
                time_exceeded::TTL_ZERO_DURING_TRANSIT,
                0,
                out,
            );
            return Ok(());
        }

        let mtu = iface.mtu;
        if mtu == 0 || packet.data_length() <= mtu {
            if header.crc_mode == CrcMode::Computed {
                let mut header = packet.remove_at_front::<Ipv4Header>()?;
                header.update_crc();
                packet.insert_at_front(Chunk::fields(header))?;
            }
            return self.send_datagram_to_output(packet, ctx, out);
        }

        if header.dont_fragment {
            tracing::warn!(packet = packet.name(), mtu, "fragmentation needed but df set");
            self.stats.dropped.record(DropReason::Other);
            Self::icmp_error(
                packet,
                IcmpType::DestinationUnreachable,
                unreachable::FRAGMENTATION_NEEDED,
                u32::try_from(mtu).unwrap_or(u32::MAX),
                out,
            );
            return Ok(());
        }

        let header_length = header.header_length();
        let payload_length = packet.data_length() - header_length;
        let fragment_length = mtu.saturating_sub(header_length) / 8 * 8;
        if fragment_length == 0 {
            return Err(EngineError::MtuTooSmall {
                interface: iface.name.clone(),
                mtu,
                header_length,
            });
        }
        let offset_base = usize::from(header.fragment_offset);
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
            let mut fragment_header = header.clone();
            if offset > 0 {
                fragment_header.options = header.copied_options();
            }
            if !last {
                fragment_header.more_fragments = true;
            }
            fragment_header.fragment_offset = u16::try_from(offset_base + offset)
                .map_err(|_| EngineError::Unfragmentable("fragment offset exceeds 16 bits"))?;
            fragment_header.total_length =
                u16::try_from(fragment_header.header_length() + this_length)
                    .map_err(|_| EngineError::Unfragmentable("fragment exceeds 65535 bytes"))?;
            if fragment_header.crc_mode == CrcMode::Computed {
                fragment_header.update_crc();
            }

            let name = if last {
                format!("{}-frag-{offset}-last", packet.name())
            } else {
                format!("{}-frag-{offset}", packet.name())
            };
            let data = packet.peek_data_at(header_length + offset, this_length)?;
            let mut fragment = Packet::with_chunk(name, data);
            fragment.tags.copy_from(&packet.tags);
            fragment.insert_at_front(Chunk::fields(fragment_header))?;
            self.stats.fragments_created += 1;
            self.send_datagram_to_output(fragment, ctx, out)?;
            offset += this_length;
        }
        Ok(())
    }

    fn send_datagram_to_output(
        &mut self,
        mut packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let interfaces = ctx.interfaces;
        let id = packet.get_tag::<InterfaceReq>()?.0;
        let iface = interfaces
            .get(id)
            .ok_or(EngineError::UnknownInterface(id))?;
        let next_hop = match packet.remove_tag_if_present::<NextHopAddressReq>() {
            Some(NextHopAddressReq(IpAddr::V4(hop))) if !hop.is_unspecified() => hop,
            _ => packet.peek_at_front::<Ipv4Header>()?.dest,
        };

        if !iface.broadcast || iface.mac.is_unspecified() {
            Self::send_to_nic(packet, iface, None, out);
            return Ok(());
        }
        let mac = if next_hop.is_broadcast() || interfaces.is_local_broadcast_v4(next_hop) {
            Some(MacAddress::BROADCAST)
        } else if next_hop.is_multicast() {
            Some(MacAddress::multicast_for_ipv4(next_hop))
        } else {
            ctx.arp.resolve(next_hop, id, ctx.now)
        };
        match mac {
            Some(mac) => Self::send_to_nic(packet, iface, Some(mac), out),
            None => self.pending.push(id, next_hop, packet),
        }
        Ok(())
    }

    fn send_to_nic(mut packet: Packet, iface: &NetworkInterface, dest: Option<MacAddress>, out: &mut Outbox) {
        packet.set_tag(InterfaceReq(iface.id));
        packet.set_tag(PacketProtocolTag(protocol::IPV4));
        if !iface.loopback {
            packet.set_tag(MacAddressReq {
                src: iface.mac,
                dest: dest.unwrap_or(MacAddress::BROADCAST),
            });
        }
        tracing::trace!(packet = packet.name(), interface = %iface.name, "to link layer");
        out.push(Emit::ToLink(packet));
    }

    // ── ARP notifications ────────────────────────────────────────────────────

    /// Release everything waiting for `address`, in arrival order.
    pub fn arp_resolved(
        &mut self,
        interface: InterfaceId,
        address: Ipv4Addr,
        mac: MacAddress,
        interfaces: &InterfaceTable,
        out: &mut Outbox,
    ) {
        let queue = self.pending.take(interface, address);
        let Some(iface) = interfaces.get(interface) else {
            for packet in &queue {
                self.drop_packet(packet, DropReason::NoInterfaceFound);
            }
            return;
        };
        if !queue.is_empty() {
            tracing::debug!(address = %address, count = queue.len(), "arp resolved, sending queued datagrams");
        }
        for packet in queue {
            Self::send_to_nic(packet, iface, Some(mac), out);
        }
    }

    pub fn arp_failed(&mut self, interface: InterfaceId, address: Ipv4Addr) {
        let queue = self.pending.take(interface, address);
        if !queue.is_empty() {
            tracing::warn!(address = %address, count = queue.len(), "arp failed, dropping queued datagrams");
        }
        for packet in &queue {
            self.drop_packet(packet, DropReason::AddressResolutionFailed);
        }
    }

    // ── Local delivery ───────────────────────────────────────────────────────

    fn reassemble_and_deliver(
        &mut self,
        packet: Packet,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let header = packet.peek_at_front::<Ipv4Header>()?;
        if header.src.is_unspecified() {
            tracing::warn!(packet = packet.name(), "datagram without source address");
        }

        let packet = if header.is_fragment() {
            self.maybe_purge(ctx.now, out);
            let header_length = header.header_length();
            let payload = packet.peek_data_at(header_length, packet.data_length() - header_length)?;
            let key = FragmentKey {
                src: header.src,
                dest: header.dest,
                identification: header.identification,
                protocol: header.protocol,
            };
            let fragment = Fragment {
                offset: usize::from(header.fragment_offset),
                more_fragments: header.more_fragments,
                header,
                payload,
                packet,
            };
            let Some(done) = self.fragments.add_fragment(key, fragment, ctx.now) else {
                return Ok(());
            };

            let mut header = done.header;
            header.more_fragments = false;
            header.fragment_offset = 0;
            header.total_length = u16::try_from(header.header_length() + done.payload_length)
                .map_err(|_| EngineError::Unfragmentable("reassembled datagram exceeds 65535 bytes"))?;
            if header.crc_mode == CrcMode::Computed {
                header.update_crc();
            }
            let mut whole = Packet::new(done.first.name());
            whole.tags = done.first.tags;
            for piece in done.payload {
                whole.insert_at_back(piece)?;
            }
            whole.set_tag(NetworkProtocolInd {
                protocol: protocol::IPV4,
                header: Chunk::fields(header.clone()),
            });
            whole.insert_at_front(Chunk::fields(header))?;
            self.stats.reassembled += 1;
            whole
        } else {
            packet
        };

        if let Some(packet) = self.run_hooks(HookPoint::LocalIn, packet) {
            self.reassemble_and_deliver_finish(packet, out)?;
        }
        Ok(())
    }

    fn reassemble_and_deliver_finish(&mut self, mut packet: Packet, out: &mut Outbox) -> Result<(), EngineError> {
        let header_at = packet.front_offset();
        let header = packet.pop_at_front_with::<Ipv4Header>(PeekFlags::ALLOW_INCORRECT)?.header;
        let transport = IP_PROTOCOLS.find_protocol(u16::from(header.protocol));
        let (local, remote) = (IpAddr::V4(header.dest), IpAddr::V4(header.src));
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

        match transport.filter(|p| self.upper_protocols.contains(p)) {
            Some(p) => {
                tracing::trace!(packet = packet.name(), protocol = %p, "delivering locally");
                self.stats.local_deliveries += 1;
                out.push(Emit::ToUpper(packet));
            }
            None if !sockets.is_empty() => {}
            None => {
                tracing::warn!(protocol = header.protocol, "transport protocol not connected");
                packet.set_front_offset(header_at)?;
                self.stats.dropped.record(DropReason::NoProtocolFound);
                Self::icmp_error(
                    packet,
                    IcmpType::DestinationUnreachable,
                    unreachable::PROTOCOL,
                    0,
                    out,
                );
            }
        }
        Ok(())
    }

    fn decapsulate(packet: &mut Packet, header: &Ipv4Header, transport: Option<Protocol>) {
        packet.set_tag(DscpInd(header.dscp()));
        packet.set_tag(EcnInd(header.ecn()));
        packet.set_tag(TosInd(header.tos));
        if let Some(transport) = transport {
            packet.set_tag(PacketProtocolTag(transport));
            packet.set_tag(DispatchProtocolReq::indication(transport));
        }
        packet.set_tag(L3AddressInd {
            src: IpAddr::V4(header.src),
            dest: IpAddr::V4(header.dest),
        });
        packet.set_tag(HopLimitInd(header.ttl));
    }

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
                IcmpType::TimeExceeded,
                time_exceeded::REASSEMBLY_TIMEOUT,
                0,
                out,
            );
        }
    }

    /// Periodic housekeeping: sweeps the fragment buffer.
    pub fn tick(&mut self, now: SimTime, out: &mut Outbox) {
        self.maybe_purge(now, out);
    }

    // ── Sockets, reinjection, lifecycle ──────────────────────────────────────

    /// A raw socket command from above. Returns the indication to send back.
    pub fn handle_command(&mut self, command: &Command) -> Option<Command> {
        self.sockets.handle_command(command)
    }

    /// Resume a datagram a hook queued, right after the hook point it was
    /// queued at. Returns `false` for an unknown ticket.
    pub fn reinject(
        &mut self,
        ticket: QueueTicket,
        ctx: &mut Ipv4Context<'_>,
        out: &mut Outbox,
    ) -> Result<bool, EngineError> {
        let Some((point, packet)) = self.hooks.take_queued(ticket) else {
            return Ok(false);
        };
        tracing::debug!(?ticket, point = %point, "reinjecting datagram");
        match point {
            HookPoint::PreRouting => self.prerouting_finish(packet, ctx, out)?,
            HookPoint::LocalIn => self.reassemble_and_deliver_finish(packet, out)?,
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

    /// Discard all parked state: ARP queues, hook queues, fragments and raw
    /// sockets.
    pub fn stop(&mut self) {
        let pending = self.pending.clear();
        let queued = self.hooks.flush();
        let fragments = self.fragments.len();
        self.fragments.clear();
        self.sockets.clear();
        tracing::info!(pending, queued, fragments, "ipv4 stopped");
    }
}
