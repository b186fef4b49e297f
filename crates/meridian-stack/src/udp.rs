//! UDP (RFC 768): socket table, ephemeral ports, checksum modes and
//! demultiplexing of received datagrams.
//!
//! Sockets are created on first use. Received unicast datagrams go to one
//! socket, preferring one bound to the exact destination address over one
//! bound to the wildcard; multicast and broadcast datagrams go to every
//! matching socket.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use meridian_core::checksum::{pseudo_header, verify_transport_checksum};
use meridian_core::config::UdpConfig;
use meridian_core::protocol;
use meridian_core::tags::{
    DispatchProtocolReq, DscpReq, HopLimitReq, InterfaceInd, InterfaceReq, L3AddressInd,
    L3AddressReq, L4PortInd, L4PortReq, MulticastReq, NetworkProtocolInd, PacketProtocolTag,
    SocketInd, SocketReq, TosReq,
};
use meridian_core::wire::udp::{UdpHeader, UDP_HEADER_LENGTH};
use meridian_core::{Chunk, CrcMode, FieldsChunk, InterfaceId, Packet, PacketError, PeekFlags, Protocol, SocketId};

use crate::interface::InterfaceTable;
use crate::stats::{DropCounters, DropReason};

const IP_PROTOCOL_UDP: u8 = 17;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum UdpError {
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
    #[error("socket {0} is already bound")]
    AlreadyBound(SocketId),
    #[error("local address {address}:{port} is already taken")]
    AddressInUse { address: IpAddr, port: u16 },
    #[error("ephemeral port range {start}..{end} exhausted, all ports occupied")]
    EphemeralPortsExhausted { start: u16, end: u16 },
    #[error("connect: unspecified remote address")]
    UnspecifiedRemote,
    #[error("connect: invalid remote port {0}")]
    InvalidRemotePort(u16),
    #[error("{0} is not a multicast address")]
    NotMulticast(IpAddr),
    #[error("group {group} already joined on {interface:?}")]
    AlreadyJoined {
        group: IpAddr,
        interface: Option<InterfaceId>,
    },
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("packet {0:?} carries no socket id")]
    MissingSocket(String),
    #[error("socket {0} has no destination address or port")]
    NoDestination(SocketId),
    #[error("source {src} and destination {dest} are of different families")]
    FamilyMismatch { src: IpAddr, dest: IpAddr },
    #[error("payload of {0} bytes does not fit a udp datagram")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

// ── Sockets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub group: IpAddr,
    /// `None` joins on every multicast interface.
    pub interface: Option<InterfaceId>,
}

#[derive(Debug, Clone)]
pub struct UdpSocket {
    pub id: SocketId,
    pub bound: bool,
    /// `None` receives on every local address.
    pub local_address: Option<IpAddr>,
    pub local_port: u16,
    pub remote_address: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub reuse_address: bool,
    /// Receive datagrams sent to broadcast addresses.
    pub broadcast: bool,
    pub multicast_loop: bool,
    pub multicast_interface: Option<InterfaceId>,
    pub ttl: Option<u8>,
    pub dscp: Option<u8>,
    pub tos: Option<u8>,
    pub memberships: Vec<Membership>,
}

impl UdpSocket {
    fn new(id: SocketId, local_port: u16) -> Self {
        Self {
            id,
            bound: false,
            local_address: None,
            local_port,
            remote_address: None,
            remote_port: None,
            reuse_address: false,
            broadcast: false,
            multicast_loop: true,
            multicast_interface: None,
            ttl: None,
            dscp: None,
            tos: None,
            memberships: Vec::new(),
        }
    }

    fn matches_remote(&self, address: IpAddr, port: u16) -> bool {
        self.remote_port.map_or(true, |p| p == port)
            && self.remote_address.map_or(true, |a| a == address)
    }

    fn is_member(&self, group: IpAddr, interface: Option<InterfaceId>) -> bool {
        self.memberships.iter().any(|m| {
            m.group == group
                && match (m.interface, interface) {
                    (Some(want), Some(got)) => want == got,
                    _ => true,
                }
        })
    }
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum UdpDelivery {
    /// Payload for the socket named by the packet's `SocketInd`.
    ToSocket(Packet),
    /// Nobody listens. The packet is rebuilt from its network header so it
    /// can be quoted in a port-unreachable error.
    PortUnreachable { packet: Packet, network: Protocol },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UdpStats {
    pub sent: u64,
    pub received: u64,
    pub passed_up: u64,
    pub dropped: DropCounters,
}

// ── Udp ───────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Udp {
    crc_mode: CrcMode,
    ephemeral_start: u16,
    ephemeral_end: u16,
    next_ephemeral: u16,
    sockets: BTreeMap<SocketId, UdpSocket>,
    /// Sockets per local port, in creation order.
    by_port: HashMap<u16, Vec<SocketId>>,
    pub stats: UdpStats,
}

impl Udp {
    pub fn new(config: &UdpConfig) -> Self {
        Self {
            crc_mode: config.crc_mode,
            ephemeral_start: config.ephemeral_port_start,
            ephemeral_end: config.ephemeral_port_end,
            next_ephemeral: config.ephemeral_port_start,
            sockets: BTreeMap::new(),
            by_port: HashMap::new(),
            stats: UdpStats::default(),
        }
    }

    pub fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    pub fn socket(&self, id: SocketId) -> Option<&UdpSocket> {
        self.sockets.get(&id)
    }

    pub fn sockets(&self) -> impl Iterator<Item = &UdpSocket> {
        self.sockets.values()
    }

    /// The socket `id`, created with an ephemeral port if it does not exist
    /// yet. Socket options are set through the returned reference.
    pub fn socket_mut(&mut self, id: SocketId) -> Result<&mut UdpSocket, UdpError> {
        if !self.sockets.contains_key(&id) {
            let port = self.ephemeral_port()?;
            self.create_socket(id, port);
        }
        self.sockets.get_mut(&id).ok_or(UdpError::UnknownSocket(id))
    }

    fn create_socket(&mut self, id: SocketId, port: u16) {
        self.by_port.entry(port).or_default().push(id);
        self.sockets.insert(id, UdpSocket::new(id, port));
        tracing::debug!(socket = %id, port, "udp socket created");
    }

    /// Next free port in the ephemeral range, searching from just after the
    /// last one handed out and wrapping at the end.
    fn ephemeral_port(&mut self) -> Result<u16, UdpError> {
        let exhausted = UdpError::EphemeralPortsExhausted {
            start: self.ephemeral_start,
            end: self.ephemeral_end,
        };
        if self.ephemeral_start >= self.ephemeral_end {
            return Err(exhausted);
        }
        let span = self.ephemeral_end - self.ephemeral_start;
        for _ in 0..span {
            let candidate = self.next_ephemeral;
            self.next_ephemeral = if candidate + 1 >= self.ephemeral_end {
                self.ephemeral_start
            } else {
                candidate + 1
            };
            if !self.by_port.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(exhausted)
    }

    /// Bind `id` to `local` (unspecified = every address) and `port`
    /// (0 = ephemeral). Returns the port bound.
    ///
    /// Two sockets may share an address and port only if both set
    /// `reuse_address`. A wildcard binding overlaps every address.
    pub fn bind(&mut self, id: SocketId, local: IpAddr, port: u16) -> Result<u16, UdpError> {
        let local_address = (!local.is_unspecified()).then_some(local);
        if self.sockets.get(&id).is_some_and(|s| s.bound) {
            return Err(UdpError::AlreadyBound(id));
        }
        if port != 0 {
            let reuse = self.sockets.get(&id).is_some_and(|s| s.reuse_address);
            let conflict = self.by_port.get(&port).into_iter().flatten().any(|other| {
                *other != id
                    && self.sockets.get(other).is_some_and(|o| {
                        let overlaps = match (o.local_address, local_address) {
                            (Some(a), Some(b)) => a == b,
                            _ => true,
                        };
                        overlaps && !(reuse && o.reuse_address)
                    })
            });
            if conflict {
                return Err(UdpError::AddressInUse {
                    address: local,
                    port,
                });
            }
        }

        if port != 0 && !self.sockets.contains_key(&id) {
            self.create_socket(id, port);
        }
        let current = self.socket_mut(id)?.local_port;
        let port = if port == 0 { current } else { port };
        if port != current {
            if let Some(list) = self.by_port.get_mut(&current) {
                list.retain(|s| *s != id);
                if list.is_empty() {
                    self.by_port.remove(&current);
                }
            }
            self.by_port.entry(port).or_default().push(id);
        }
        let socket = self.socket_mut(id)?;
        socket.bound = true;
        socket.local_address = local_address;
        socket.local_port = port;
        tracing::debug!(socket = %id, local = %local, port, "udp socket bound");
        Ok(port)
    }

    pub fn connect(&mut self, id: SocketId, remote: IpAddr, port: u16) -> Result<(), UdpError> {
        if remote.is_unspecified() {
            return Err(UdpError::UnspecifiedRemote);
        }
        if port == 0 {
            return Err(UdpError::InvalidRemotePort(port));
        }
        let socket = self.socket_mut(id)?;
        socket.remote_address = Some(remote);
        socket.remote_port = Some(port);
        tracing::debug!(socket = %id, remote = %remote, port, "udp socket connected");
        Ok(())
    }

    pub fn close(&mut self, id: SocketId, interfaces: &mut InterfaceTable) -> Result<(), UdpError> {
        let socket = self.sockets.remove(&id).ok_or(UdpError::UnknownSocket(id))?;
        if let Some(list) = self.by_port.get_mut(&socket.local_port) {
            list.retain(|s| *s != id);
            if list.is_empty() {
                self.by_port.remove(&socket.local_port);
            }
        }
        for m in &socket.memberships {
            self.leave_on_interfaces(m, interfaces);
        }
        tracing::debug!(socket = %id, port = socket.local_port, "udp socket closed");
        Ok(())
    }

    /// Drop every socket.
    pub fn clear(&mut self) {
        self.sockets.clear();
        self.by_port.clear();
    }

    // ── Multicast membership ─────────────────────────────────────────────────

    /// Join `group` on `interface`, or on every multicast interface.
    pub fn join_multicast_group(
        &mut self,
        id: SocketId,
        group: IpAddr,
        interface: Option<InterfaceId>,
        interfaces: &mut InterfaceTable,
    ) -> Result<(), UdpError> {
        if !group.is_multicast() {
            return Err(UdpError::NotMulticast(group));
        }
        if let Some(i) = interface {
            if interfaces.get(i).is_none() {
                return Err(UdpError::UnknownInterface(i));
            }
        }
        let membership = Membership { group, interface };
        let socket = self.socket_mut(id)?;
        if socket.memberships.contains(&membership) {
            return Err(UdpError::AlreadyJoined { group, interface });
        }
        socket.memberships.push(membership);

        let targets: Vec<InterfaceId> = match interface {
            Some(i) => vec![i],
            None => interfaces
                .iter()
                .filter(|i| i.multicast)
                .map(|i| i.id)
                .collect(),
        };
        for target in targets {
            if let Some(ie) = interfaces.get_mut(target) {
                match group {
                    IpAddr::V4(g) => ie.join_v4(g),
                    IpAddr::V6(g) => ie.join_v6(g),
                }
            }
        }
        tracing::debug!(socket = %id, group = %group, "joined multicast group");
        Ok(())
    }

    /// Leave every membership of `id` in `group`.
    pub fn leave_multicast_group(
        &mut self,
        id: SocketId,
        group: IpAddr,
        interfaces: &mut InterfaceTable,
    ) -> Result<(), UdpError> {
        let socket = self.sockets.get_mut(&id).ok_or(UdpError::UnknownSocket(id))?;
        let (left, kept): (Vec<Membership>, Vec<Membership>) =
            socket.memberships.iter().partition(|m| m.group == group);
        socket.memberships = kept;
        for m in &left {
            self.leave_on_interfaces(m, interfaces);
        }
        Ok(())
    }

    /// Remove `m.group` from interfaces no other socket still needs it on.
    fn leave_on_interfaces(&self, m: &Membership, interfaces: &mut InterfaceTable) {
        let targets: Vec<InterfaceId> = match m.interface {
            Some(i) => vec![i],
            None => interfaces.iter().filter(|i| i.multicast).map(|i| i.id).collect(),
        };
        for target in targets {
            let still_wanted = self
                .sockets
                .values()
                .any(|s| s.is_member(m.group, Some(target)));
            if still_wanted {
                continue;
            }
            if let Some(ie) = interfaces.get_mut(target) {
                match m.group {
                    IpAddr::V4(g) => ie.leave_v4(g),
                    IpAddr::V6(g) => ie.leave_v6(g),
                }
            }
        }
    }

    // ── Send ─────────────────────────────────────────────────────────────────

    /// Encapsulate an application payload carrying `SocketReq`. The result
    /// is tagged for the network protocol matching the destination family.
    pub fn send(&mut self, mut packet: Packet) -> Result<Packet, UdpError> {
        let id = packet
            .find_tag::<SocketReq>()
            .map(|t| t.0)
            .ok_or_else(|| UdpError::MissingSocket(packet.name().to_string()))?;
        let socket = self.socket_mut(id)?.clone();

        let requested = packet.find_tag::<L3AddressReq>().cloned();
        let dest = requested
            .as_ref()
            .map(|r| r.dest)
            .filter(|d| !d.is_unspecified())
            .or(socket.remote_address)
            .ok_or(UdpError::NoDestination(id))?;
        let dest_port = packet
            .find_tag::<L4PortReq>()
            .map(|p| p.dest_port)
            .or(socket.remote_port)
            .ok_or(UdpError::NoDestination(id))?;
        let src = requested
            .as_ref()
            .map(|r| r.src)
            .filter(|s| !s.is_unspecified())
            .or(socket.local_address)
            .unwrap_or(match dest {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            });
        if src.is_ipv4() != dest.is_ipv4() {
            return Err(UdpError::FamilyMismatch { src, dest });
        }

        packet.set_tag(L3AddressReq {
            src,
            dest,
            non_local_src: requested.is_some_and(|r| r.non_local_src),
        });
        packet.set_tag(L4PortReq {
            src_port: socket.local_port,
            dest_port,
        });
        if dest.is_multicast() {
            if let Some(i) = socket.multicast_interface {
                packet.add_tag_if_absent(InterfaceReq(i));
            }
            packet.add_tag_if_absent(MulticastReq {
                multicast_loop: socket.multicast_loop,
                interface: socket.multicast_interface,
            });
        }
        if let Some(ttl) = socket.ttl {
            packet.add_tag_if_absent(HopLimitReq(ttl));
        }
        if let Some(dscp) = socket.dscp {
            packet.add_tag_if_absent(DscpReq(dscp));
        }
        if let Some(tos) = socket.tos {
            packet.add_tag_if_absent(TosReq(tos));
        }

        let total = UDP_HEADER_LENGTH + packet.data_length();
        let total_length = u16::try_from(total).map_err(|_| UdpError::PayloadTooLarge(total))?;
        let header = UdpHeader {
            src_port: socket.local_port,
            dest_port,
            total_length,
            crc: self.crc_mode.sentinel(),
            crc_mode: self.crc_mode,
        };
        packet.insert_at_front(Chunk::fields(header))?;
        packet.set_tag(PacketProtocolTag(protocol::UDP));
        let network = if dest.is_ipv4() {
            protocol::IPV4
        } else {
            protocol::IPV6
        };
        packet.set_tag(DispatchProtocolReq::request(network));
        self.stats.sent += 1;
        tracing::trace!(socket = %id, dest = %dest, dest_port, "udp datagram sent");
        Ok(packet)
    }

    // ── Receive ──────────────────────────────────────────────────────────────

    /// Demultiplex a datagram positioned at its UDP header. It must carry
    /// `L3AddressInd` and `NetworkProtocolInd`.
    pub fn process(&mut self, mut packet: Packet) -> Vec<UdpDelivery> {
        self.stats.received += 1;
        packet.remove_tag_if_present::<PacketProtocolTag>();
        let header_at = packet.front_offset();
        let Ok(peeked) = packet.pop_at_front_with::<UdpHeader>(PeekFlags::ALLOW_INCORRECT) else {
            self.drop_packet(&packet, DropReason::Malformed);
            return Vec::new();
        };
        let header = peeked.header;
        let (Some(addrs), Some(network)) = (
            packet.find_tag::<L3AddressInd>().copied(),
            packet.find_tag::<NetworkProtocolInd>().map(|n| n.protocol),
        ) else {
            self.drop_packet(&packet, DropReason::Malformed);
            return Vec::new();
        };

        let total = usize::from(header.total_length);
        let bad_length = total < UDP_HEADER_LENGTH || total > UDP_HEADER_LENGTH + packet.data_length();
        if bad_length || !self.verify_crc(&header, peeked.correct, &packet, addrs) {
            self.drop_packet(&packet, DropReason::IncorrectlyReceived);
            return Vec::new();
        }
        if total - UDP_HEADER_LENGTH < packet.data_length() {
            // Trim lower-layer padding.
            if packet.set_back_offset(header_at + total).is_err() {
                self.drop_packet(&packet, DropReason::Malformed);
                return Vec::new();
            }
        }

        let interface = packet.find_tag::<InterfaceInd>().map(|i| i.0);
        let dest = addrs.dest;
        let is_broadcast = matches!(dest, IpAddr::V4(d) if d.is_broadcast());
        let targets: Vec<SocketId> = if dest.is_multicast() || is_broadcast {
            self.sockets_for_group(dest, header.dest_port, addrs.src, header.src_port, is_broadcast, interface)
        } else {
            self.socket_for_unicast(dest, header.dest_port, addrs.src, header.src_port)
                .into_iter()
                .collect()
        };

        let Some((last, rest)) = targets.split_last() else {
            tracing::debug!(packet = packet.name(), port = header.dest_port, "no socket on port");
            self.stats.dropped.record(DropReason::NoPortFound);
            return self
                .undeliverable(packet, header_at, network)
                .into_iter()
                .collect();
        };

        // Copies for all but the last socket, which gets the original.
        let mut out = Vec::with_capacity(targets.len());
        for id in rest {
            out.push(UdpDelivery::ToSocket(self.send_up(packet.dup(), *id, &header)));
        }
        out.push(UdpDelivery::ToSocket(self.send_up(packet, *last, &header)));
        out
    }

    fn send_up(&mut self, mut packet: Packet, id: SocketId, header: &UdpHeader) -> Packet {
        packet.remove_tag_if_present::<DispatchProtocolReq>();
        packet.set_tag(SocketInd(id));
        packet.set_tag(L4PortInd {
            src_port: header.src_port,
            dest_port: header.dest_port,
        });
        self.stats.passed_up += 1;
        tracing::trace!(socket = %id, packet = packet.name(), "udp payload passed up");
        packet
    }

    fn undeliverable(&mut self, mut packet: Packet, header_at: usize, network: Protocol) -> Option<UdpDelivery> {
        let ip_header = packet.find_tag::<NetworkProtocolInd>()?.header.clone();
        packet.set_front_offset(header_at).ok()?;
        packet.trim();
        packet.insert_at_front(ip_header).ok()?;
        packet.set_name(format!("port-unreachable-{}", packet.name()));
        Some(UdpDelivery::PortUnreachable { packet, network })
    }

    fn drop_packet(&mut self, packet: &Packet, reason: DropReason) {
        tracing::debug!(packet = packet.name(), reason = %reason, "udp drop");
        self.stats.dropped.record(reason);
    }

    fn verify_crc(&self, header: &UdpHeader, header_correct: bool, packet: &Packet, addrs: L3AddressInd) -> bool {
        match header.crc_mode {
            CrcMode::Disabled => header.crc == 0,
            CrcMode::DeclaredCorrect => header_correct && packet.is_data_correct(),
            CrcMode::DeclaredIncorrect | CrcMode::Computed => {
                if header.crc == 0 && header.crc_mode == CrcMode::Computed {
                    // No checksum transmitted.
                    return header_correct && packet.is_data_correct();
                }
                if !header_correct || !packet.is_data_correct() {
                    return false;
                }
                let mut segment = header.to_bytes().to_vec();
                let payload_len = usize::from(header.total_length).saturating_sub(UDP_HEADER_LENGTH);
                let data = packet.data_bytes();
                segment.extend_from_slice(&data[..payload_len.min(data.len())]);
                match pseudo_header(addrs.src, addrs.dest, IP_PROTOCOL_UDP, segment.len()) {
                    Some(pseudo) => verify_transport_checksum(&pseudo, &segment),
                    None => false,
                }
            }
        }
    }

    // ── Demultiplexing ───────────────────────────────────────────────────────

    /// Newest matching socket bound to `local`, else the newest matching
    /// wildcard socket.
    fn socket_for_unicast(&self, local: IpAddr, port: u16, remote: IpAddr, remote_port: u16) -> Option<SocketId> {
        let list = self.by_port.get(&port)?;
        let mut wildcard = None;
        for id in list.iter().rev() {
            let Some(s) = self.sockets.get(id) else {
                continue;
            };
            let local_ok = s.local_address.map_or(true, |a| a == local);
            if !local_ok || !s.matches_remote(remote, remote_port) {
                continue;
            }
            if s.local_address.is_none() {
                wildcard.get_or_insert(*id);
            } else {
                return Some(*id);
            }
        }
        wildcard
    }

    fn sockets_for_group(
        &self,
        dest: IpAddr,
        port: u16,
        remote: IpAddr,
        remote_port: u16,
        broadcast: bool,
        interface: Option<InterfaceId>,
    ) -> Vec<SocketId> {
        let Some(list) = self.by_port.get(&port) else {
            return Vec::new();
        };
        list.iter()
            .filter_map(|id| self.sockets.get(id))
            .filter(|s| s.matches_remote(remote, remote_port))
            .filter(|s| {
                if broadcast {
                    s.broadcast
                } else {
                    s.is_member(dest, interface)
                }
            })
            .map(|s| s.id)
            .collect()
    }
}
