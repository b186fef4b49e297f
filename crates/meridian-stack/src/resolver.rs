//! Address resolution: an ARP cache for IPv4 and Neighbour Discovery for
//! IPv6.
//!
//! Both resolve lazily. A miss records a pending entry, asks for one
//! request per next hop, and the engine parks its packets until the node
//! reports completion or failure.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use meridian_core::chunk::Chunk;
use meridian_core::protocol;
use meridian_core::tags::{
    HopLimitReq, InterfaceInd, InterfaceReq, L3AddressInd, L3AddressReq, MacAddressReq,
    NextHopAddressReq, PacketProtocolTag,
};
use meridian_core::wire::arp::{ArpOpcode, ArpPacket};
use meridian_core::wire::icmp::{Icmpv6Header, Icmpv6Type};
use meridian_core::wire::ndp::{
    NdpBody, FLAG_OVERRIDE, FLAG_ROUTER, FLAG_SOLICITED, OPTION_SOURCE_LINK_LAYER,
    OPTION_TARGET_LINK_LAYER,
};
use meridian_core::wire::ipv6::Ipv6Header;
use meridian_core::{CrcMode, InterfaceId, MacAddress, Packet, SimTime};

use crate::icmp::icmpv6_checksum_ok;
use crate::interface::{solicited_node_for, InterfaceTable};
use crate::stats::{DropCounters, DropReason};

pub const RETRY_TIMEOUT: Duration = Duration::from_secs(1);
pub const RETRY_COUNT: u32 = 3;
pub const CACHE_TIMEOUT: Duration = Duration::from_secs(120);

const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending { retries: u32, next_retry: SimTime },
    Resolved { mac: MacAddress, expires: SimTime },
}

// ── ARP ───────────────────────────────────────────────────────────────────────

/// Link-address lookup the IPv4 engine consults before sending.
pub trait AddressResolver: Send {
    /// The link address of `next_hop` on `interface`, or `None` while
    /// resolution is pending. A miss starts resolution.
    fn resolve(&mut self, next_hop: Ipv4Addr, interface: InterfaceId, now: SimTime) -> Option<MacAddress>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpRequest {
    pub interface: InterfaceId,
    pub target: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpEvent {
    Resolved {
        interface: InterfaceId,
        address: Ipv4Addr,
        mac: MacAddress,
    },
    Failed {
        interface: InterfaceId,
        address: Ipv4Addr,
    },
}

#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<(InterfaceId, Ipv4Addr), EntryState>,
    requests: Vec<ArpRequest>,
}

impl AddressResolver for ArpCache {
    fn resolve(&mut self, next_hop: Ipv4Addr, interface: InterfaceId, now: SimTime) -> Option<MacAddress> {
        match self.entries.get(&(interface, next_hop)) {
            Some(EntryState::Resolved { mac, expires }) if now < *expires => return Some(*mac),
            Some(EntryState::Pending { .. }) => return None,
            _ => {}
        }
        tracing::debug!(interface = %interface, address = %next_hop, "starting arp resolution");
        self.entries.insert(
            (interface, next_hop),
            EntryState::Pending {
                retries: 0,
                next_retry: now + RETRY_TIMEOUT,
            },
        );
        self.requests.push(ArpRequest {
            interface,
            target: next_hop,
        });
        None
    }
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the node should broadcast.
    pub fn take_requests(&mut self) -> Vec<ArpRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn is_pending(&self, interface: InterfaceId, address: Ipv4Addr) -> bool {
        matches!(
            self.entries.get(&(interface, address)),
            Some(EntryState::Pending { .. })
        )
    }

    /// Insert or refresh a binding. Reports completion if it was pending.
    pub fn learn(
        &mut self,
        interface: InterfaceId,
        address: Ipv4Addr,
        mac: MacAddress,
        now: SimTime,
    ) -> Option<ArpEvent> {
        let previous = self.entries.insert(
            (interface, address),
            EntryState::Resolved {
                mac,
                expires: now + CACHE_TIMEOUT,
            },
        );
        match previous {
            Some(EntryState::Pending { .. }) => Some(ArpEvent::Resolved {
                interface,
                address,
                mac,
            }),
            _ => None,
        }
    }

    /// RFC 826 reception: merge the sender if known, add it if we are the
    /// target, and answer requests for our own address.
    pub fn process_packet(
        &mut self,
        arp: &ArpPacket,
        interface: InterfaceId,
        interfaces: &InterfaceTable,
        now: SimTime,
    ) -> (Option<ArpPacket>, Option<ArpEvent>) {
        let Some(own) = interfaces.get(interface) else {
            return (None, None);
        };
        let own_ip = own.ipv4_address();
        let known = self.entries.contains_key(&(interface, arp.sender_ip));
        let for_us = own_ip == Some(arp.target_ip);
        let event = if known || for_us {
            self.learn(interface, arp.sender_ip, arp.sender_mac, now)
        } else {
            None
        };
        let reply = match (for_us, arp.opcode) {
            (true, ArpOpcode::Request) => Some(ArpPacket {
                opcode: ArpOpcode::Reply,
                sender_mac: own.mac,
                sender_ip: arp.target_ip,
                target_mac: arp.sender_mac,
                target_ip: arp.sender_ip,
            }),
            _ => None,
        };
        (reply, event)
    }

    /// Retransmit pending requests and fail the ones out of retries.
    pub fn tick(&mut self, now: SimTime) -> Vec<ArpEvent> {
        let mut failed = Vec::new();
        let mut retry = Vec::new();
        for (&(interface, address), state) in &mut self.entries {
            if let EntryState::Pending {
                retries,
                next_retry,
            } = state
            {
                if now < *next_retry {
                    continue;
                }
                if *retries + 1 >= RETRY_COUNT {
                    failed.push((interface, address));
                } else {
                    *retries += 1;
                    *next_retry = now + RETRY_TIMEOUT;
                    retry.push(ArpRequest {
                        interface,
                        target: address,
                    });
                }
            }
        }
        self.requests.extend(retry);
        self.entries
            .retain(|_, s| !matches!(s, EntryState::Resolved { expires, .. } if now >= *expires));
        failed
            .into_iter()
            .map(|(interface, address)| {
                self.entries.remove(&(interface, address));
                tracing::debug!(interface = %interface, address = %address, "arp resolution failed");
                ArpEvent::Failed { interface, address }
            })
            .collect()
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.requests.clear();
    }
}

/// Broadcast request frame body for `target` from `interface`.
pub fn arp_request_for(request: &ArpRequest, interfaces: &InterfaceTable) -> Option<ArpPacket> {
    let own = interfaces.get(request.interface)?;
    Some(ArpPacket {
        opcode: ArpOpcode::Request,
        sender_mac: own.mac,
        sender_ip: own.ipv4_address()?,
        target_mac: MacAddress::UNSPECIFIED,
        target_ip: request.target,
    })
}

// ── Neighbour Discovery ───────────────────────────────────────────────────────

/// Link-address lookup the IPv6 engine consults before sending.
pub trait NeighbourResolver: Send {
    fn lookup(&self, address: Ipv6Addr, interface: InterfaceId, now: SimTime) -> Option<MacAddress>;
}

#[derive(Debug)]
pub enum NdAction {
    /// A default router was picked for `dest`. IPv6 caches the choice so
    /// later datagrams skip the fallback.
    RouterSelected {
        dest: Ipv6Addr,
        router: Ipv6Addr,
        interface: InterfaceId,
    },
    /// Next hop and link address are known; back to IPv6 for sending.
    Resolved(Packet),
    /// An ND message to send as a locally originated ICMPv6 datagram.
    Transmit(Packet),
    /// Resolution failed; report address-unreachable for this datagram.
    Unreachable(Packet),
}

#[derive(Debug)]
pub struct NeighbourDiscovery {
    cache: HashMap<(InterfaceId, Ipv6Addr), EntryState>,
    pending: HashMap<(InterfaceId, Ipv6Addr), VecDeque<Packet>>,
    default_routers: Vec<(Ipv6Addr, InterfaceId)>,
    router: bool,
    crc_mode: CrcMode,
    pub dropped: DropCounters,
}

impl NeighbourResolver for NeighbourDiscovery {
    fn lookup(&self, address: Ipv6Addr, interface: InterfaceId, now: SimTime) -> Option<MacAddress> {
        match self.cache.get(&(interface, address)) {
            Some(EntryState::Resolved { mac, expires }) if now < *expires => Some(*mac),
            _ => None,
        }
    }
}

impl NeighbourDiscovery {
    pub fn new(router: bool, crc_mode: CrcMode) -> Self {
        Self {
            cache: HashMap::new(),
            pending: HashMap::new(),
            default_routers: Vec::new(),
            router,
            crc_mode,
            dropped: DropCounters::default(),
        }
    }

    pub fn add_default_router(&mut self, address: Ipv6Addr, interface: InterfaceId) {
        self.default_routers.push((address, interface));
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// A datagram (positioned at its IPv6 header) that the engine could not
    /// send. With `InterfaceReq` and `NextHopAddressReq` it only needs the
    /// link address; without, a default router is chosen first.
    pub fn process_datagram(
        &mut self,
        mut packet: Packet,
        interfaces: &InterfaceTable,
        now: SimTime,
    ) -> Vec<NdAction> {
        let mut actions = Vec::new();
        let hop = match (
            packet.find_tag::<InterfaceReq>(),
            packet.find_tag::<NextHopAddressReq>(),
        ) {
            (Some(InterfaceReq(i)), Some(NextHopAddressReq(IpAddr::V6(a)))) => Some((*a, *i)),
            _ => {
                let chosen = self.default_routers.first().copied();
                if let (Some((router, interface)), Ok(header)) =
                    (chosen, packet.peek_at_front::<Ipv6Header>())
                {
                    actions.push(NdAction::RouterSelected {
                        dest: header.dest,
                        router,
                        interface,
                    });
                }
                chosen
            }
        };
        let Some((next_hop, interface)) = hop else {
            tracing::debug!(packet = packet.name(), "no default router");
            self.dropped.record(DropReason::NoRouteFound);
            return vec![NdAction::Unreachable(packet)];
        };
        packet.set_tag(InterfaceReq(interface));
        packet.set_tag(NextHopAddressReq(IpAddr::V6(next_hop)));

        let Some(own) = interfaces.get(interface) else {
            self.dropped.record(DropReason::NoInterfaceFound);
            return actions;
        };
        if let Some(mac) = self.lookup(next_hop, interface, now) {
            packet.set_tag(MacAddressReq {
                src: own.mac,
                dest: mac,
            });
            actions.push(NdAction::Resolved(packet));
            return actions;
        }

        self.pending
            .entry((interface, next_hop))
            .or_default()
            .push_back(packet);
        if matches!(self.cache.get(&(interface, next_hop)), Some(EntryState::Pending { .. })) {
            return actions;
        }
        self.cache.insert(
            (interface, next_hop),
            EntryState::Pending {
                retries: 0,
                next_retry: now + RETRY_TIMEOUT,
            },
        );
        tracing::debug!(interface = %interface, address = %next_hop, "sending neighbour solicitation");
        actions.extend(
            self.solicitation(next_hop, interface, interfaces)
                .map(NdAction::Transmit),
        );
        actions
    }

    /// A received ND message, data region starting at the ICMPv6 header.
    pub fn handle_message(
        &mut self,
        packet: Packet,
        interfaces: &InterfaceTable,
        now: SimTime,
    ) -> Vec<NdAction> {
        if !icmpv6_checksum_ok(&packet) {
            self.dropped.record(DropReason::IncorrectlyReceived);
            return Vec::new();
        }
        let (Ok(header), Ok(body)) = (
            packet.peek_at_front::<Icmpv6Header>(),
            packet.peek_at::<NdpBody>(meridian_core::wire::icmp::ICMP_HEADER_LENGTH),
        ) else {
            self.dropped.record(DropReason::Malformed);
            return Vec::new();
        };
        let (Some(InterfaceInd(interface)), Some(addrs)) = (
            packet.find_tag::<InterfaceInd>().copied(),
            packet.find_tag::<L3AddressInd>().copied(),
        ) else {
            self.dropped.record(DropReason::Malformed);
            return Vec::new();
        };
        let IpAddr::V6(src) = addrs.src else {
            return Vec::new();
        };
        match header.icmp_type {
            Icmpv6Type::NeighbourSolicitation => {
                let mut out = Vec::new();
                if !src.is_unspecified() && body.option_type == OPTION_SOURCE_LINK_LAYER {
                    out.extend(self.learn(interface, src, body.link_layer, now, interfaces));
                }
                let owns_target = interfaces
                    .get(interface)
                    .is_some_and(|i| i.has_ipv6(body.target));
                if owns_target {
                    let dest = if src.is_unspecified() { ALL_NODES } else { src };
                    out.extend(
                        self.advertisement(body.target, dest, interface, interfaces)
                            .map(NdAction::Transmit),
                    );
                }
                out
            }
            Icmpv6Type::NeighbourAdvertisement => {
                self.learn(interface, body.target, body.link_layer, now, interfaces)
            }
            other => {
                tracing::trace!(icmp_type = ?other, "ignoring neighbour discovery message");
                Vec::new()
            }
        }
    }

    fn learn(
        &mut self,
        interface: InterfaceId,
        address: Ipv6Addr,
        mac: MacAddress,
        now: SimTime,
        interfaces: &InterfaceTable,
    ) -> Vec<NdAction> {
        self.cache.insert(
            (interface, address),
            EntryState::Resolved {
                mac,
                expires: now + CACHE_TIMEOUT,
            },
        );
        let own_mac = interfaces
            .get(interface)
            .map(|i| i.mac)
            .unwrap_or(MacAddress::UNSPECIFIED);
        self.pending
            .remove(&(interface, address))
            .unwrap_or_default()
            .into_iter()
            .map(|mut p| {
                p.set_tag(MacAddressReq {
                    src: own_mac,
                    dest: mac,
                });
                NdAction::Resolved(p)
            })
            .collect()
    }

    /// Retransmit solicitations; give up on next hops out of retries.
    pub fn tick(&mut self, interfaces: &InterfaceTable, now: SimTime) -> Vec<NdAction> {
        let mut out = Vec::new();
        let mut failed = Vec::new();
        let mut resend = Vec::new();
        for (&key, state) in &mut self.cache {
            if let EntryState::Pending {
                retries,
                next_retry,
            } = state
            {
                if now < *next_retry {
                    continue;
                }
                if *retries + 1 >= RETRY_COUNT {
                    failed.push(key);
                } else {
                    *retries += 1;
                    *next_retry = now + RETRY_TIMEOUT;
                    resend.push(key);
                }
            }
        }
        for (interface, address) in resend {
            out.extend(
                self.solicitation(address, interface, interfaces)
                    .map(NdAction::Transmit),
            );
        }
        for key in failed {
            self.cache.remove(&key);
            for packet in self.pending.remove(&key).unwrap_or_default() {
                tracing::debug!(address = %key.1, packet = packet.name(), "neighbour unreachable");
                self.dropped.record(DropReason::AddressResolutionFailed);
                out.push(NdAction::Unreachable(packet));
            }
        }
        self.cache
            .retain(|_, s| !matches!(s, EntryState::Resolved { expires, .. } if now >= *expires));
        out
    }

    fn solicitation(
        &self,
        target: Ipv6Addr,
        interface: InterfaceId,
        interfaces: &InterfaceTable,
    ) -> Option<Packet> {
        let own = interfaces.get(interface)?;
        let src = own
            .source_for_v6(target)
            .filter(|a| !own.is_tentative_v6(*a))
            .unwrap_or(Ipv6Addr::UNSPECIFIED);
        let body = NdpBody {
            target,
            option_type: OPTION_SOURCE_LINK_LAYER,
            link_layer: own.mac,
        };
        let header = Icmpv6Header::new(Icmpv6Type::NeighbourSolicitation, 0);
        Some(self.message("ns", header, body, src, solicited_node_for(target), interface))
    }

    fn advertisement(
        &self,
        target: Ipv6Addr,
        dest: Ipv6Addr,
        interface: InterfaceId,
        interfaces: &InterfaceTable,
    ) -> Option<Packet> {
        let own = interfaces.get(interface)?;
        let mut header = Icmpv6Header::new(Icmpv6Type::NeighbourAdvertisement, 0);
        let mut flags = FLAG_OVERRIDE;
        if dest != ALL_NODES {
            flags |= FLAG_SOLICITED;
        }
        if self.router {
            flags |= FLAG_ROUTER;
        }
        header.set_value(flags);
        let body = NdpBody {
            target,
            option_type: OPTION_TARGET_LINK_LAYER,
            link_layer: own.mac,
        };
        Some(self.message("na", header, body, target, dest, interface))
    }

    fn message(
        &self,
        name: &str,
        mut header: Icmpv6Header,
        body: NdpBody,
        src: Ipv6Addr,
        dest: Ipv6Addr,
        interface: InterfaceId,
    ) -> Packet {
        header.crc_mode = self.crc_mode;
        header.crc = self.crc_mode.sentinel();
        let mut packet = Packet::with_chunk(name, Chunk::fields(body));
        // A fresh packet has no popped region, so the insert cannot fail.
        let _ = packet.insert_at_front(Chunk::fields(header));
        packet.set_tag(PacketProtocolTag(protocol::ICMPV6));
        packet.set_tag(L3AddressReq::new(IpAddr::V6(src), IpAddr::V6(dest)));
        packet.set_tag(InterfaceReq(interface));
        packet.set_tag(HopLimitReq(255));
        packet
    }

    pub fn flush(&mut self) {
        self.cache.clear();
        self.pending.clear();
    }
}

/// Destination of a datagram still positioned at its IPv6 header.
pub fn datagram_destination(packet: &Packet) -> Option<Ipv6Addr> {
    packet.peek_at_front::<Ipv6Header>().ok().map(|h| h.dest)
}
