//! A simulated host or router: the engines of one node and the work queue
//! that moves packets between them.
//!
//! ```text
//!        UDP ─┐   ┌─ ICMP   ┌─ raw sockets
//!             ▼   ▼         ▼
//!        transport ↔ network dispatcher
//!             │             │
//!           IPv4          IPv6 ── ND
//!             │  ARP        │
//!        network ↔ link dispatcher
//!             │
//!        Ethernet ─▶ transmit queue (RED) ─▶ wire
//! ```
//!
//! Engines report what they want done through an outbox. The node queues
//! those requests and runs the queue to completion for every external event:
//! a frame arriving, an application send, a timer tick.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use meridian_core::config::{
    parse_ipv4_cidr, parse_ipv6_cidr, ConfigError, MeridianConfig, NodeConfig, RedConfig,
};
use meridian_core::protocol;
use meridian_core::tags::{
    DispatchProtocolReq, EcnReq, InterfaceInd, InterfaceReq, L3AddressReq, L4PortReq,
    MacAddressReq, NetworkProtocolInd, PacketProtocolTag, ServicePrimitive, SocketReq,
};
use meridian_core::wire::arp::{ArpOpcode, ArpPacket};
use meridian_core::wire::icmp::{unreachable, unreachable_v6, IcmpType, Icmpv6Type};
use meridian_core::{
    Chunk, InterfaceId, MacAddress, Packet, Protocol, SimTime, SocketId,
};

use crate::crc_insertion::{CrcInsertionHook, CRC_INSERTION_PRIORITY};
use crate::dispatcher::{Command, DispatchError, Message, MessageDispatcher, PortId, PortSide, SocketCommand};
use crate::ethernet::{Ethernet, EthernetStats};
use crate::icmp::{Icmp, IcmpStats};
use crate::interface::{
    link_local_for, AddressState, InterfaceTable, Ipv4InterfaceData, NetworkInterface, LOOPBACK_ID,
};
use crate::ipv4::{Ipv4, Ipv4Context, Ipv4Stats};
use crate::ipv6::{Ipv6, Ipv6Context, Ipv6Stats};
use crate::netfilter::QueueTicket;
use crate::outbox::{Emit, Outbox};
use crate::red::{RedQueue, RedStats};
use crate::resolver::{arp_request_for, ArpCache, ArpEvent, NdAction, NeighbourDiscovery};
use crate::routing::{
    Ipv4Route, Ipv6Route, MulticastOutput, MulticastRoute, StaticIpv4RoutingTable,
    StaticIpv6RoutingTable,
};
use crate::stats::DropCounters;
use crate::udp::{Udp, UdpDelivery, UdpError, UdpStats};
use crate::EngineError;

// ── Ports ─────────────────────────────────────────────────────────────────────

// Transport ↔ network dispatcher.
const UDP_PORT: PortId = PortId(0);
const ICMP_PORT: PortId = PortId(1);
const RAW_PORT: PortId = PortId(2);
const TN_IPV4: PortId = PortId(10);
const TN_IPV6: PortId = PortId(11);

// Network ↔ link dispatcher. Interface `n` hangs off port `LINK_PORT_BASE + n`.
const NL_IPV4: PortId = PortId(20);
const NL_IPV6: PortId = PortId(21);
const NL_ARP: PortId = PortId(22);
const LINK_PORT_BASE: u32 = 100;

/// Leading frame bytes shown in trace logs.
const HEX_PREVIEW: usize = 34;

fn link_port(interface: InterfaceId) -> PortId {
    PortId(LINK_PORT_BASE + interface.0)
}

fn port_interface(port: PortId) -> Option<InterfaceId> {
    port.0.checked_sub(LINK_PORT_BASE).map(InterfaceId)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node {node} has no interface {interface:?}")]
    UnknownInterface { node: String, interface: String },
    #[error("message dispatched to unexpected port {0:?}")]
    Misrouted(PortId),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Udp(#[from] UdpError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl NodeError {
    /// Setup mistakes that no amount of retrying fixes. These leave the
    /// node through its public entry points instead of being counted as
    /// per-packet drops.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Engine(EngineError::MtuTooSmall { .. })
                | NodeError::Udp(UdpError::EphemeralPortsExhausted { .. })
        )
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub frames_received: u64,
    pub frames_queued: u64,
    pub frames_dropped: u64,
    pub frames_transmitted: u64,
    pub looped_back: u64,
    pub datagrams_delivered: u64,
    pub to_mobility: u64,
    pub to_tunnel: u64,
    pub engine_errors: u64,
    pub dispatch_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub red: Option<RedStats>,
}

/// Everything a node counted, for the shutdown report.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub node: NodeStats,
    pub ethernet: EthernetStats,
    pub ipv4: Ipv4Stats,
    pub ipv6: Ipv6Stats,
    pub udp: UdpStats,
    pub icmp: IcmpStats,
    pub neighbour_discovery: DropCounters,
    pub queues: BTreeMap<String, QueueReport>,
}

// ── Transmit queues ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum TransmitQueue {
    Red(RedQueue),
    Fifo {
        frames: VecDeque<Packet>,
        capacity: usize,
    },
}

impl TransmitQueue {
    fn new(config: &RedConfig) -> Self {
        if config.enabled {
            TransmitQueue::Red(RedQueue::new(config))
        } else {
            TransmitQueue::Fifo {
                frames: VecDeque::new(),
                capacity: config.capacity,
            }
        }
    }

    /// `false` means the frame was dropped.
    fn enqueue(&mut self, frame: Packet, now: SimTime, rng: &mut dyn RngCore) -> Result<bool, EngineError> {
        match self {
            TransmitQueue::Red(q) => q.enqueue(frame, now, rng),
            TransmitQueue::Fifo { frames, capacity } => {
                if frames.len() >= *capacity {
                    return Ok(false);
                }
                frames.push_back(frame);
                Ok(true)
            }
        }
    }

    fn dequeue(&mut self, now: SimTime) -> Option<Packet> {
        match self {
            TransmitQueue::Red(q) => q.dequeue(now),
            TransmitQueue::Fifo { frames, .. } => frames.pop_front(),
        }
    }

    fn len(&self) -> usize {
        match self {
            TransmitQueue::Red(q) => q.len(),
            TransmitQueue::Fifo { frames, .. } => frames.len(),
        }
    }

    fn clear(&mut self) -> usize {
        match self {
            TransmitQueue::Red(q) => q.clear(),
            TransmitQueue::Fifo { frames, .. } => {
                let n = frames.len();
                frames.clear();
                n
            }
        }
    }
}

// ── Shared tables ─────────────────────────────────────────────────────────────

/// State the engines borrow through their contexts.
#[derive(Debug)]
struct Tables {
    interfaces: InterfaceTable,
    routes_v4: StaticIpv4RoutingTable,
    routes_v6: StaticIpv6RoutingTable,
    arp: ArpCache,
    nd: NeighbourDiscovery,
    rng: StdRng,
}

impl Tables {
    fn v4(&mut self, now: SimTime) -> Ipv4Context<'_> {
        Ipv4Context {
            interfaces: &self.interfaces,
            routes: &self.routes_v4,
            arp: &mut self.arp,
            rng: &mut self.rng,
            now,
        }
    }

    fn v6(&self, now: SimTime) -> Ipv6Context<'_> {
        Ipv6Context {
            interfaces: &self.interfaces,
            routes: &self.routes_v6,
            neighbours: &self.nd,
            now,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Node {
    name: String,
    tables: Tables,
    tn: MessageDispatcher,
    nl: MessageDispatcher,
    udp: Udp,
    icmp: Icmp,
    ipv4: Ipv4,
    ipv6: Ipv6,
    ethernet: Ethernet,
    queues: BTreeMap<InterfaceId, TransmitQueue>,
    work: VecDeque<Emit>,
    received: Vec<Packet>,
    indications: Vec<Command>,
    sent: u64,
    pub stats: NodeStats,
}

impl Node {
    /// Build the node `node` describes. `seed` drives its bit-error draws
    /// and RED decisions.
    pub fn from_config(node: &NodeConfig, config: &MeridianConfig, seed: u64) -> Result<Self, NodeError> {
        let interfaces = build_interfaces(node, config)?;

        let mut routes_v4 = StaticIpv4RoutingTable::new(node.forwarding, node.multicast_forwarding);
        routes_v4.add_interface_routes(&interfaces);
        for r in &node.routes {
            let (destination, prefix_len) = parse_ipv4_cidr(&r.destination)?;
            routes_v4.add_route(Ipv4Route {
                destination,
                prefix_len,
                gateway: r.gateway,
                interface: interface_named(&interfaces, node, &r.interface)?,
                metric: r.metric,
            });
        }
        for r in &node.multicast_routes {
            let (origin, origin_prefix_len) = parse_ipv4_cidr(&r.origin)?;
            let input_interface = if r.input_interface.is_empty() {
                None
            } else {
                Some(interface_named(&interfaces, node, &r.input_interface)?)
            };
            let outputs = r
                .output_interfaces
                .iter()
                .map(|o| {
                    Ok(MulticastOutput {
                        interface: interface_named(&interfaces, node, &o.interface)?,
                        leaf: o.leaf,
                        ttl_threshold: o.ttl_threshold,
                    })
                })
                .collect::<Result<Vec<_>, NodeError>>()?;
            routes_v4.add_multicast_route(MulticastRoute {
                origin,
                origin_prefix_len,
                group: r.group,
                input_interface,
                outputs,
            });
        }

        let mut routes_v6 = StaticIpv6RoutingTable::new(node.forwarding);
        routes_v6.add_interface_routes(&interfaces);
        for r in &node.ipv6_routes {
            let (destination, prefix_len) = parse_ipv6_cidr(&r.destination)?;
            routes_v6.add_route(Ipv6Route {
                destination,
                prefix_len,
                next_hop: r.next_hop,
                interface: interface_named(&interfaces, node, &r.interface)?,
                metric: r.metric,
                expires: None,
            });
        }

        let mut nd = NeighbourDiscovery::new(node.forwarding, config.ipv6.crc_mode);
        for r in &node.default_routers {
            nd.add_default_router(r.address, interface_named(&interfaces, node, &r.interface)?);
        }

        let mut ipv4 = Ipv4::new(&config.ipv4);
        ipv4.hooks_mut()
            .register(CRC_INSERTION_PRIORITY, Box::new(CrcInsertionHook::new()));
        ipv4.register_upper_protocol(protocol::UDP);
        ipv4.register_upper_protocol(protocol::ICMPV4);

        let mut ipv6 = Ipv6::new(&config.ipv6);
        ipv6.hooks_mut()
            .register(CRC_INSERTION_PRIORITY, Box::new(CrcInsertionHook::new()));
        ipv6.register_upper_protocol(protocol::UDP);
        ipv6.register_upper_protocol(protocol::ICMPV6);

        let tn = transport_dispatcher(&node.name)?;
        let nl = link_dispatcher(&node.name, &interfaces)?;

        let queues = interfaces
            .iter()
            .filter(|i| !i.loopback)
            .map(|i| (i.id, TransmitQueue::new(&config.red)))
            .collect();

        tracing::info!(
            node = %node.name,
            interfaces = interfaces.len(),
            forwarding = node.forwarding,
            "node built"
        );
        Ok(Self {
            name: node.name.clone(),
            tables: Tables {
                interfaces,
                routes_v4,
                routes_v6,
                arp: ArpCache::new(),
                nd,
                rng: StdRng::seed_from_u64(seed),
            },
            tn,
            nl,
            udp: Udp::new(&config.udp),
            icmp: Icmp::new(config.ipv4.crc_mode, config.ipv6.crc_mode),
            ipv4,
            ipv6,
            ethernet: Ethernet::new(config.simulation.link_crc_mode),
            queues,
            work: VecDeque::new(),
            received: Vec::new(),
            indications: Vec::new(),
            sent: 0,
            stats: NodeStats::default(),
        })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.tables.interfaces
    }

    pub fn interface_id(&self, name: &str) -> Option<InterfaceId> {
        self.tables.interfaces.by_name(name).map(|i| i.id)
    }

    pub fn ipv4(&self) -> &Ipv4 {
        &self.ipv4
    }

    pub fn ipv4_mut(&mut self) -> &mut Ipv4 {
        &mut self.ipv4
    }

    pub fn ipv6(&self) -> &Ipv6 {
        &self.ipv6
    }

    pub fn ipv6_mut(&mut self) -> &mut Ipv6 {
        &mut self.ipv6
    }

    pub fn udp(&self) -> &Udp {
        &self.udp
    }

    pub fn icmp(&self) -> &Icmp {
        &self.icmp
    }

    /// Frames waiting on `interface`.
    pub fn queued_frames(&self, interface: InterfaceId) -> usize {
        self.queues.get(&interface).map_or(0, TransmitQueue::len)
    }

    /// Datagrams handed to sockets since the last call.
    pub fn take_received(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.received)
    }

    /// Socket indications since the last call.
    pub fn take_indications(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.indications)
    }

    // ── External events ──────────────────────────────────────────────────────

    /// Serialized Ethernet frame arriving on `interface`. `bit_error` is the
    /// link's verdict on whether the frame was corrupted in flight.
    pub fn receive_frame(
        &mut self,
        interface: InterfaceId,
        bytes: Bytes,
        bit_error: bool,
        now: SimTime,
    ) -> Result<(), NodeError> {
        self.stats.frames_received += 1;
        tracing::trace!(
            node = %self.name,
            interface = %interface,
            bytes = bytes.len(),
            head = %hex::encode(&bytes[..bytes.len().min(HEX_PREVIEW)]),
            "frame arrived"
        );
        let result = self.inbound(interface, bytes, bit_error, now);
        self.settle(result, now)
    }

    /// Next frame to put on the wire from `interface`.
    pub fn dequeue_frame(&mut self, interface: InterfaceId, now: SimTime) -> Option<Bytes> {
        let frame = self.queues.get_mut(&interface)?.dequeue(now)?;
        self.stats.frames_transmitted += 1;
        Some(frame.data_bytes())
    }

    /// Send `payload` from `socket` to `dest`. The socket is created with an
    /// ephemeral port on first use. A nonzero `ecn` requests that codepoint.
    pub fn send_udp(
        &mut self,
        socket: SocketId,
        dest: SocketAddr,
        payload: Bytes,
        ecn: u8,
        now: SimTime,
    ) -> Result<(), NodeError> {
        self.sent += 1;
        let mut packet = Packet::with_chunk(format!("{}-udp-{}", self.name, self.sent), Chunk::bytes(payload));
        let src = match dest {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        packet.set_tag(SocketReq(socket));
        packet.set_tag(L3AddressReq::new(src, dest.ip()));
        packet.set_tag(L4PortReq {
            src_port: 0,
            dest_port: dest.port(),
        });
        if ecn != 0 {
            packet.set_tag(EcnReq(ecn));
        }
        let packet = self.udp.send(packet)?;
        let result = self.send_down(packet, UDP_PORT, now);
        self.settle(result, now)
    }

    /// Send an echo request to `dest`. Replies are counted in the ICMP
    /// statistics.
    pub fn ping(
        &mut self,
        dest: IpAddr,
        identifier: u16,
        sequence: u16,
        payload: Bytes,
        now: SimTime,
    ) -> Result<(), NodeError> {
        self.sent += 1;
        let name = format!("{}-ping-{}", self.name, self.sent);
        let packet = self.icmp.echo_request(&name, dest, identifier, sequence, payload);
        let network = if dest.is_ipv6() { protocol::IPV6 } else { protocol::IPV4 };
        let result = self.send_icmp(packet, network, now);
        self.settle(result, now)
    }

    /// Periodic timers: address promotion, fragment sweeps, tentative
    /// retries, neighbour and ARP retransmissions.
    pub fn tick(&mut self, now: SimTime) -> Result<(), NodeError> {
        self.tables.interfaces.tick(now);

        let mut out = Outbox::new();
        let held = self.ipv6.tick(&mut self.tables.v6(now), &mut out).map_err(NodeError::from);
        self.ipv4.tick(now, &mut out);
        self.absorb(out);

        let actions = self.tables.nd.tick(&self.tables.interfaces, now);
        let resolved = held.and(self.neighbour_actions(actions, now));
        if let Err(e) = &resolved {
            self.record_error(e);
        }
        for event in self.tables.arp.tick(now) {
            self.arp_event(event);
        }
        self.drain_arp_requests();

        let expired = self.tables.routes_v6.purge_expired(now);
        if expired > 0 {
            tracing::debug!(node = %self.name, expired, "ipv6 routes expired");
        }
        let rest = self.run(now);
        resolved.and(rest)
    }

    /// Drop all parked state and queued frames.
    pub fn stop(&mut self) {
        self.ipv4.stop();
        self.ipv6.stop();
        self.tables.arp.flush();
        self.tables.nd.flush();
        self.udp.clear();
        let frames: usize = self.queues.values_mut().map(TransmitQueue::clear).sum();
        self.work.clear();
        tracing::info!(node = %self.name, frames, "node stopped");
    }

    pub fn report(&self) -> NodeReport {
        let queues = self
            .queues
            .iter()
            .filter_map(|(id, q)| {
                let name = self.tables.interfaces.get(*id)?.name.clone();
                let red = match q {
                    TransmitQueue::Red(r) => Some(r.stats.clone()),
                    TransmitQueue::Fifo { .. } => None,
                };
                Some((name, QueueReport { length: q.len(), red }))
            })
            .collect();
        NodeReport {
            name: self.name.clone(),
            node: self.stats.clone(),
            ethernet: self.ethernet.stats.clone(),
            ipv4: self.ipv4.stats.clone(),
            ipv6: self.ipv6.stats.clone(),
            udp: self.udp.stats.clone(),
            icmp: self.icmp.stats.clone(),
            neighbour_discovery: self.tables.nd.dropped.clone(),
            queues,
        }
    }

    // ── Sockets ──────────────────────────────────────────────────────────────

    /// Bind a UDP socket. Port 0 picks an ephemeral port. Returns the port.
    pub fn udp_bind(&mut self, socket: SocketId, local: IpAddr, port: u16) -> Result<u16, NodeError> {
        Ok(self.udp.bind(socket, local, port)?)
    }

    pub fn udp_connect(&mut self, socket: SocketId, remote: IpAddr, port: u16) -> Result<(), NodeError> {
        Ok(self.udp.connect(socket, remote, port)?)
    }

    pub fn udp_close(&mut self, socket: SocketId) -> Result<(), NodeError> {
        self.udp.close(socket, &mut self.tables.interfaces)?;
        self.tn.unregister_socket(socket);
        Ok(())
    }

    /// Join `group` on the named interface, or on every multicast
    /// interface when `interface` is `None`.
    pub fn join_multicast_group(
        &mut self,
        socket: SocketId,
        group: IpAddr,
        interface: Option<&str>,
    ) -> Result<(), NodeError> {
        let interface = match interface {
            Some(name) => Some(self.interface_id(name).ok_or_else(|| NodeError::UnknownInterface {
                node: self.name.clone(),
                interface: name.to_string(),
            })?),
            None => None,
        };
        Ok(self
            .udp
            .join_multicast_group(socket, group, interface, &mut self.tables.interfaces)?)
    }

    /// Open a raw socket receiving `protocol` (everything if `None`)
    /// addressed to `local`. The family of `local` picks the engine.
    pub fn raw_bind(
        &mut self,
        socket: SocketId,
        protocol: Option<Protocol>,
        local: IpAddr,
        now: SimTime,
    ) -> Result<(), NodeError> {
        let network = if local.is_ipv6() {
            protocol::IPV6
        } else {
            protocol::IPV4
        };
        self.raw_command(socket, network, SocketCommand::Bind { protocol, local }, now)
    }

    pub fn raw_close(&mut self, socket: SocketId, network: Protocol, now: SimTime) -> Result<(), NodeError> {
        self.raw_command(socket, network, SocketCommand::Close, now)
    }

    // ── Hooks ────────────────────────────────────────────────────────────────

    /// Resume a datagram that a hook on the `network` engine queued.
    /// Returns `false` for an unknown ticket.
    pub fn reinject(&mut self, network: Protocol, ticket: QueueTicket, now: SimTime) -> Result<bool, NodeError> {
        let mut out = Outbox::new();
        let result = if network == protocol::IPV6 {
            self.ipv6.reinject(ticket, &mut self.tables.v6(now), &mut out)
        } else {
            self.ipv4.reinject(ticket, &mut self.tables.v4(now), &mut out)
        };
        self.absorb(out);
        self.run(now)?;
        Ok(result?)
    }

    fn raw_command(
        &mut self,
        socket: SocketId,
        network: Protocol,
        kind: SocketCommand,
        now: SimTime,
    ) -> Result<(), NodeError> {
        let mut command = Command::new(kind);
        command.tags.set_tag(SocketReq(socket));
        command.tags.set_tag(DispatchProtocolReq::request(network));
        let message = Message::Command(command);
        let port = self.tn.arrived(&message, RAW_PORT)?;
        let Message::Command(command) = &message else {
            return Ok(());
        };
        let indication = match port {
            TN_IPV4 => self.ipv4.handle_command(command),
            TN_IPV6 => self.ipv6.handle_command(command),
            other => return Err(NodeError::Misrouted(other)),
        };
        if let Some(indication) = indication {
            self.work.push_back(Emit::CommandUp(indication));
        }
        self.run(now)
    }

    // ── Work queue ───────────────────────────────────────────────────────────

    /// Record the outcome of an event's first step, then finish the event.
    /// The first fatal error seen is returned once the queue is empty.
    fn settle(&mut self, result: Result<(), NodeError>, now: SimTime) -> Result<(), NodeError> {
        let first = match result {
            Err(e) if e.is_fatal() => {
                self.record_error(&e);
                Some(e)
            }
            Err(e) => {
                self.record_error(&e);
                None
            }
            Ok(()) => None,
        };
        let rest = self.run(now);
        match first {
            Some(e) => Err(e),
            None => rest,
        }
    }

    fn run(&mut self, now: SimTime) -> Result<(), NodeError> {
        let mut fatal = None;
        while let Some(emit) = self.work.pop_front() {
            if let Err(e) = self.handle(emit, now) {
                self.record_error(&e);
                if e.is_fatal() && fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    fn record_error(&mut self, error: &NodeError) {
        if error.is_fatal() {
            tracing::error!(node = %self.name, error = %error, "configuration error");
        } else {
            tracing::warn!(node = %self.name, error = %error, "packet processing failed");
        }
        match error {
            NodeError::Dispatch(_) | NodeError::Misrouted(_) => self.stats.dispatch_errors += 1,
            _ => self.stats.engine_errors += 1,
        }
    }

    /// Queue what an engine emitted, plus any ARP requests it caused.
    fn absorb(&mut self, out: Outbox) {
        self.work.extend(out);
        self.drain_arp_requests();
    }

    fn handle(&mut self, emit: Emit, now: SimTime) -> Result<(), NodeError> {
        match emit {
            Emit::ToLink(packet) => self.to_link(packet, now),
            Emit::ToUpper(packet) => self.to_transport(packet, now),
            Emit::CommandUp(command) => self.command_up(command),
            Emit::Icmpv4Error {
                packet,
                icmp_type,
                code,
                value,
            } => {
                match self
                    .icmp
                    .error_v4(&packet, icmp_type, code, value, &self.tables.interfaces)
                {
                    Some(error) => self.send_icmp(error, protocol::IPV4, now),
                    None => Ok(()),
                }
            }
            Emit::Icmpv6Error {
                packet,
                icmp_type,
                code,
                value,
            } => match self.icmp.error_v6(&packet, icmp_type, code, value) {
                Some(error) => self.send_icmp(error, protocol::IPV6, now),
                None => Ok(()),
            },
            Emit::ToNeighbourDiscovery(packet) => {
                let actions = self
                    .tables
                    .nd
                    .process_datagram(packet, &self.tables.interfaces, now);
                self.neighbour_actions(actions, now)
            }
            Emit::NeighbourDiscoveryMessage(packet) => {
                let actions = self
                    .tables
                    .nd
                    .handle_message(packet, &self.tables.interfaces, now);
                self.neighbour_actions(actions, now)
            }
            Emit::ToMobility(packet) => {
                self.stats.to_mobility += 1;
                tracing::debug!(node = %self.name, packet = packet.name(), "no mobility support, dropping");
                Ok(())
            }
            Emit::ToTunnel(packet) => {
                self.stats.to_tunnel += 1;
                tracing::debug!(node = %self.name, packet = packet.name(), "no tunnel endpoint, dropping");
                Ok(())
            }
        }
    }

    // ── Downwards ────────────────────────────────────────────────────────────

    /// Dispatch a transport packet from `from` to its network engine.
    fn send_down(&mut self, packet: Packet, from: PortId, now: SimTime) -> Result<(), NodeError> {
        let port = self.tn.arrived_packet(&packet, from)?;
        let mut out = Outbox::new();
        let result = match port {
            TN_IPV4 => self
                .ipv4
                .handle_from_upper(packet, &mut self.tables.v4(now), &mut out),
            TN_IPV6 => self
                .ipv6
                .handle_from_upper(packet, &mut self.tables.v6(now), &mut out),
            other => return Err(NodeError::Misrouted(other)),
        };
        self.absorb(out);
        Ok(result?)
    }

    fn send_icmp(&mut self, mut packet: Packet, network: Protocol, now: SimTime) -> Result<(), NodeError> {
        packet.set_tag(DispatchProtocolReq::request(network));
        self.send_down(packet, ICMP_PORT, now)
    }

    fn to_link(&mut self, packet: Packet, now: SimTime) -> Result<(), NodeError> {
        let from = match packet.find_tag::<PacketProtocolTag>() {
            Some(PacketProtocolTag(p)) if *p == protocol::IPV6 => NL_IPV6,
            Some(PacketProtocolTag(p)) if *p == protocol::ARP => NL_ARP,
            _ => NL_IPV4,
        };
        let port = self.nl.arrived_packet(&packet, from)?;
        let interface = port_interface(port).ok_or(NodeError::Misrouted(port))?;
        let iface = self
            .tables
            .interfaces
            .get(interface)
            .ok_or(EngineError::UnknownInterface(interface))?;
        if iface.loopback {
            return self.loop_back(packet, now);
        }

        let frame = self.ethernet.encapsulate(packet, iface)?;
        let queue = self
            .queues
            .get_mut(&interface)
            .ok_or(EngineError::UnknownInterface(interface))?;
        if queue.enqueue(frame, now, &mut self.tables.rng)? {
            self.stats.frames_queued += 1;
        } else {
            self.stats.frames_dropped += 1;
            tracing::debug!(node = %self.name, interface = %interface, "transmit queue dropped frame");
        }
        Ok(())
    }

    /// Loopback delivers the serialized datagram straight back up.
    fn loop_back(&mut self, packet: Packet, now: SimTime) -> Result<(), NodeError> {
        let network = packet.get_tag::<PacketProtocolTag>().map_err(EngineError::from)?.0;
        let mut looped = Packet::with_chunk(packet.name(), Chunk::bytes(packet.data_bytes()));
        looped.set_tag(InterfaceInd(LOOPBACK_ID));
        looped.set_tag(PacketProtocolTag(network));
        looped.set_tag(DispatchProtocolReq::indication(network));
        self.stats.looped_back += 1;
        let port = self.nl.arrived_packet(&looped, link_port(LOOPBACK_ID))?;
        self.to_network(port, looped, now)
    }

    // ── Upwards ──────────────────────────────────────────────────────────────

    fn inbound(&mut self, interface: InterfaceId, bytes: Bytes, bit_error: bool, now: SimTime) -> Result<(), NodeError> {
        let iface = self
            .tables
            .interfaces
            .get(interface)
            .ok_or(EngineError::UnknownInterface(interface))?;
        let mut frame = Packet::with_chunk(format!("{}-frame", iface.full_path), Chunk::bytes(bytes));
        frame.bit_error = bit_error;
        let Some(packet) = self.ethernet.decapsulate(frame, iface) else {
            return Ok(());
        };
        let port = self.nl.arrived_packet(&packet, link_port(interface))?;
        self.to_network(port, packet, now)
    }

    fn to_network(&mut self, port: PortId, packet: Packet, now: SimTime) -> Result<(), NodeError> {
        let mut out = Outbox::new();
        let result = match port {
            NL_IPV4 => self
                .ipv4
                .handle_from_lower(packet, &mut self.tables.v4(now), &mut out),
            NL_IPV6 => self
                .ipv6
                .handle_from_lower(packet, &mut self.tables.v6(now), &mut out),
            NL_ARP => return self.arp_received(packet, now),
            other => return Err(NodeError::Misrouted(other)),
        };
        self.absorb(out);
        Ok(result?)
    }

    fn to_transport(&mut self, packet: Packet, now: SimTime) -> Result<(), NodeError> {
        let v6 = packet
            .find_tag::<NetworkProtocolInd>()
            .is_some_and(|n| n.protocol == protocol::IPV6);
        let (from, network) = if v6 {
            (TN_IPV6, protocol::IPV6)
        } else {
            (TN_IPV4, protocol::IPV4)
        };
        match self.tn.arrived_packet(&packet, from)? {
            UDP_PORT => {
                for delivery in self.udp.process(packet) {
                    match delivery {
                        UdpDelivery::ToSocket(p) => self.deliver(p),
                        UdpDelivery::PortUnreachable { packet, network } => {
                            self.port_unreachable(&packet, network, now)?
                        }
                    }
                }
                Ok(())
            }
            ICMP_PORT => {
                let reply = if v6 {
                    self.icmp.process_v6(packet)
                } else {
                    self.icmp.process_v4(packet)
                };
                match reply {
                    Some(reply) => self.send_icmp(reply, network, now),
                    None => Ok(()),
                }
            }
            RAW_PORT => {
                self.deliver(packet);
                Ok(())
            }
            other => Err(NodeError::Misrouted(other)),
        }
    }

    fn port_unreachable(&mut self, packet: &Packet, network: Protocol, now: SimTime) -> Result<(), NodeError> {
        let error = if network == protocol::IPV6 {
            self.icmp.error_v6(
                packet,
                Icmpv6Type::DestinationUnreachable,
                unreachable_v6::PORT_UNREACHABLE,
                0,
            )
        } else {
            self.icmp.error_v4(
                packet,
                IcmpType::DestinationUnreachable,
                unreachable::PORT,
                0,
                &self.tables.interfaces,
            )
        };
        match error {
            Some(error) => self.send_icmp(error, network, now),
            None => Ok(()),
        }
    }

    fn deliver(&mut self, packet: Packet) {
        self.stats.datagrams_delivered += 1;
        tracing::debug!(node = %self.name, packet = packet.name(), bytes = packet.data_length(), "delivered to socket");
        self.received.push(packet);
    }

    fn command_up(&mut self, command: Command) -> Result<(), NodeError> {
        let message = Message::Command(command);
        let port = self.tn.arrived(&message, TN_IPV4)?;
        if let Message::Command(command) = message {
            tracing::debug!(node = %self.name, port = port.0, kind = ?command.kind, "socket indication");
            self.indications.push(command);
        }
        Ok(())
    }

    // ── Address resolution ───────────────────────────────────────────────────

    /// Carry out what Neighbour Discovery asked for. Per-packet failures are
    /// recorded here; the first fatal one is returned unrecorded.
    fn neighbour_actions(&mut self, actions: Vec<NdAction>, now: SimTime) -> Result<(), NodeError> {
        let mut fatal = None;
        for action in actions {
            let mut out = Outbox::new();
            let result = match action {
                NdAction::RouterSelected {
                    dest,
                    router,
                    interface,
                } => {
                    self.ipv6.remember_next_hop(dest, router, interface, now);
                    Ok(())
                }
                NdAction::Resolved(p) => self.ipv6.send_resolved(p, &mut self.tables.v6(now), &mut out),
                NdAction::Transmit(p) => self
                    .ipv6
                    .handle_from_upper(p, &mut self.tables.v6(now), &mut out),
                NdAction::Unreachable(p) => {
                    self.ipv6.neighbour_unreachable(p, &mut out);
                    Ok(())
                }
            };
            self.absorb(out);
            match result.map_err(NodeError::from) {
                Err(e) if e.is_fatal() => {
                    fatal.get_or_insert(e);
                }
                Err(e) => self.record_error(&e),
                Ok(()) => {}
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    fn arp_received(&mut self, packet: Packet, now: SimTime) -> Result<(), NodeError> {
        let interface = packet.get_tag::<InterfaceInd>().map_err(EngineError::from)?.0;
        let body = packet.peek_at_front::<ArpPacket>().map_err(EngineError::from)?;
        let (reply, event) = self
            .tables
            .arp
            .process_packet(&body, interface, &self.tables.interfaces, now);
        if let Some(reply) = reply {
            let dest = reply.target_mac;
            if let Some(frame) = self.arp_frame(reply, interface, dest) {
                self.work.push_back(Emit::ToLink(frame));
            }
        }
        if let Some(event) = event {
            self.arp_event(event);
        }
        Ok(())
    }

    fn arp_event(&mut self, event: ArpEvent) {
        let mut out = Outbox::new();
        match event {
            ArpEvent::Resolved {
                interface,
                address,
                mac,
            } => self
                .ipv4
                .arp_resolved(interface, address, mac, &self.tables.interfaces, &mut out),
            ArpEvent::Failed { interface, address } => self.ipv4.arp_failed(interface, address),
        }
        self.absorb(out);
    }

    fn drain_arp_requests(&mut self) {
        for request in self.tables.arp.take_requests() {
            let Some(body) = arp_request_for(&request, &self.tables.interfaces) else {
                tracing::debug!(node = %self.name, interface = %request.interface, "no ipv4 address to resolve from");
                continue;
            };
            if let Some(frame) = self.arp_frame(body, request.interface, MacAddress::BROADCAST) {
                self.work.push_back(Emit::ToLink(frame));
            }
        }
    }

    fn arp_frame(&self, body: ArpPacket, interface: InterfaceId, dest: MacAddress) -> Option<Packet> {
        let iface = self.tables.interfaces.get(interface)?;
        let name = match body.opcode {
            ArpOpcode::Request => "arp-request",
            ArpOpcode::Reply => "arp-reply",
        };
        let mut packet = Packet::with_chunk(name, Chunk::fields(body));
        packet.set_tag(PacketProtocolTag(protocol::ARP));
        packet.set_tag(InterfaceReq(interface));
        packet.set_tag(MacAddressReq { src: iface.mac, dest });
        Some(packet)
    }
}

// ── Construction helpers ──────────────────────────────────────────────────────

fn interface_named(interfaces: &InterfaceTable, node: &NodeConfig, name: &str) -> Result<InterfaceId, NodeError> {
    interfaces
        .by_name(name)
        .map(|i| i.id)
        .ok_or_else(|| NodeError::UnknownInterface {
            node: node.name.clone(),
            interface: name.to_string(),
        })
}

/// Every configured interface plus loopback. IPv6 addresses, the derived
/// link-local one included, start tentative for the DAD delay.
fn build_interfaces(node: &NodeConfig, config: &MeridianConfig) -> Result<InterfaceTable, NodeError> {
    let dad_delay = Duration::from_millis(node.dad_delay_millis.unwrap_or(config.ipv6.dad_delay_millis));
    let state = if dad_delay.is_zero() {
        AddressState::Preferred
    } else {
        AddressState::Tentative { until: dad_delay }
    };

    let mut interfaces = InterfaceTable::new();
    for c in &node.interfaces {
        let mut iface = NetworkInterface::new(c.name.as_str(), c.mac);
        iface.full_path = format!("{}.{}", node.name, c.name);
        iface.mtu = c.mtu;
        iface.broadcast = c.broadcast;
        iface.multicast = c.multicast;
        iface.point_to_point = c.point_to_point;
        if !c.ipv4.is_empty() {
            let (address, prefix_len) = parse_ipv4_cidr(&c.ipv4)?;
            iface.ipv4 = Some(Ipv4InterfaceData {
                address,
                prefix_len,
                multicast_groups: Vec::new(),
            });
        }
        iface.add_ipv6(link_local_for(c.mac), 64, state);
        for a in &c.ipv6 {
            let (address, prefix_len) = parse_ipv6_cidr(a)?;
            iface.add_ipv6(address, prefix_len, state);
        }
        for g in &c.multicast_groups {
            match g.parse::<IpAddr>() {
                Ok(IpAddr::V4(group)) if group.is_multicast() => iface.join_v4(group),
                Ok(IpAddr::V6(group)) if group.is_multicast() => iface.join_v6(group),
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "{}: {g:?} is not a multicast group",
                        iface.full_path
                    ))
                    .into())
                }
            }
        }
        interfaces.add(iface);
    }
    Ok(interfaces)
}

fn transport_dispatcher(node: &str) -> Result<MessageDispatcher, DispatchError> {
    let mut tn = MessageDispatcher::new(format!("{node}.tn"));
    for port in [UDP_PORT, ICMP_PORT, RAW_PORT] {
        tn.add_port(port, PortSide::Upper);
    }
    for port in [TN_IPV4, TN_IPV6] {
        tn.add_port(port, PortSide::Lower);
    }
    let registrations = [
        (protocol::UDP, UDP_PORT, ServicePrimitive::Indication),
        (protocol::ICMPV4, ICMP_PORT, ServicePrimitive::Indication),
        (protocol::ICMPV6, ICMP_PORT, ServicePrimitive::Indication),
        (protocol::IPV4, TN_IPV4, ServicePrimitive::Request),
        (protocol::IPV6, TN_IPV6, ServicePrimitive::Request),
    ];
    for (protocol, port, primitive) in registrations {
        let announced = tn.register_protocol(protocol, port, primitive)?;
        tracing::trace!(node, protocol = %protocol, ports = announced.len(), "announced");
    }
    Ok(tn)
}

fn link_dispatcher(node: &str, interfaces: &InterfaceTable) -> Result<MessageDispatcher, DispatchError> {
    let mut nl = MessageDispatcher::new(format!("{node}.nl"));
    for port in [NL_IPV4, NL_IPV6, NL_ARP] {
        nl.add_port(port, PortSide::Upper);
    }
    for i in interfaces.iter() {
        nl.add_port(link_port(i.id), PortSide::Lower);
    }
    let registrations = [
        (protocol::IPV4, NL_IPV4),
        (protocol::IPV6, NL_IPV6),
        (protocol::ARP, NL_ARP),
    ];
    for (protocol, port) in registrations {
        nl.register_protocol(protocol, port, ServicePrimitive::Indication)?;
    }
    for i in interfaces.iter() {
        let announced = nl.register_interface(i.id, link_port(i.id))?;
        tracing::trace!(node, interface = %i.name, ports = announced.len(), "announced");
    }
    Ok(nl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::tags::SocketInd;
    use crate::stats::DropReason;

    const HOST_A: usize = 0;
    const ROUTER: usize = 1;
    const HOST_B: usize = 2;

    fn t(millis: u64) -> SimTime {
        Duration::from_millis(millis)
    }

    /// The default topology with frames moved by hand.
    struct Net {
        nodes: Vec<Node>,
        links: Vec<((usize, InterfaceId), (usize, InterfaceId))>,
    }

    impl Net {
        fn build(config: &MeridianConfig) -> Self {
            let nodes: Vec<Node> = config
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| Node::from_config(n, config, i as u64).unwrap())
                .collect();
            let end = |s: &str| {
                let (node, iface) = s.rsplit_once('.').unwrap();
                let idx = nodes.iter().position(|n| n.name() == node).unwrap();
                (idx, nodes[idx].interface_id(iface).unwrap())
            };
            let links = config.links.iter().map(|l| (end(&l.a), end(&l.b))).collect();
            Self { nodes, links }
        }

        fn preferred() -> Self {
            let mut config = MeridianConfig::default();
            config.ipv6.dad_delay_millis = 0;
            Self::build(&config)
        }

        /// Move frames both ways on every link until the network is quiet.
        fn pump(&mut self, now: SimTime) {
            for _ in 0..100 {
                let mut moved = false;
                for &(a, b) in &self.links.clone() {
                    for ((from, fi), (to, ti)) in [(a, b), (b, a)] {
                        let frames: Vec<Bytes> =
                            std::iter::from_fn(|| self.nodes[from].dequeue_frame(fi, now)).collect();
                        moved |= !frames.is_empty();
                        for f in frames {
                            self.nodes[to].receive_frame(ti, f, false, now).unwrap();
                        }
                    }
                }
                if !moved {
                    return;
                }
            }
            panic!("network never went quiet");
        }

        fn tick_all(&mut self, now: SimTime) {
            for n in &mut self.nodes {
                n.tick(now).unwrap();
            }
        }
    }

    fn any_v4() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn any_v6() -> IpAddr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }

    #[test]
    fn ipv4_datagram_crosses_the_router() {
        let mut net = Net::preferred();
        net.nodes[HOST_B].udp_bind(SocketId(1), any_v4(), 5000).unwrap();
        net.nodes[HOST_A]
            .send_udp(SocketId(7), "10.0.1.2:5000".parse().unwrap(), Bytes::from_static(b"hello"), 0, t(0))
            .unwrap();
        net.pump(t(0));

        let got = net.nodes[HOST_B].take_received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data_bytes(), Bytes::from_static(b"hello"));
        assert_eq!(got[0].find_tag::<SocketInd>(), Some(&SocketInd(SocketId(1))));
        assert_eq!(net.nodes[ROUTER].ipv4().stats.forwarded, 1);
        assert!(net.nodes[HOST_A].ipv4().pending().is_empty());
    }

    #[test]
    fn unbound_port_draws_port_unreachable() {
        let mut net = Net::preferred();
        net.nodes[HOST_A]
            .send_udp(SocketId(7), "10.0.1.2:6000".parse().unwrap(), Bytes::from_static(b"x"), 0, t(0))
            .unwrap();
        net.pump(t(0));

        assert_eq!(net.nodes[HOST_B].udp().stats.dropped.get(DropReason::NoPortFound), 1);
        assert_eq!(net.nodes[HOST_B].icmp().stats.errors_sent, 1);
        assert_eq!(net.nodes[HOST_A].icmp().stats.errors_received, 1);
        assert!(net.nodes[HOST_A].take_received().is_empty());
    }

    #[test]
    fn ipv6_datagram_reaches_host_through_default_router() {
        let mut net = Net::preferred();
        net.nodes[HOST_B].udp_bind(SocketId(1), any_v6(), 5001).unwrap();
        net.nodes[HOST_A]
            .send_udp(
                SocketId(7),
                "[2001:db8:1::2]:5001".parse().unwrap(),
                Bytes::from_static(b"six"),
                0,
                t(0),
            )
            .unwrap();
        net.pump(t(0));

        let got = net.nodes[HOST_B].take_received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data_bytes(), Bytes::from_static(b"six"));
        assert_eq!(net.nodes[ROUTER].ipv6().stats.forwarded, 1);
    }

    #[test]
    fn tentative_source_holds_datagram_until_preferred() {
        let mut net = Net::build(&MeridianConfig::default());
        net.nodes[HOST_B].udp_bind(SocketId(1), any_v6(), 5001).unwrap();
        net.nodes[HOST_A]
            .send_udp(
                SocketId(7),
                "[2001:db8:1::2]:5001".parse().unwrap(),
                Bytes::from_static(b"late"),
                0,
                t(0),
            )
            .unwrap();
        net.pump(t(0));
        assert!(net.nodes[HOST_B].take_received().is_empty());

        for ms in [1000, 2000, 3000, 4000] {
            net.tick_all(t(ms));
            net.pump(t(ms));
        }
        assert_eq!(net.nodes[HOST_B].take_received().len(), 1);
    }

    #[test]
    fn loopback_never_touches_the_wire() {
        let mut net = Net::preferred();
        let a = &mut net.nodes[HOST_A];
        a.udp_bind(SocketId(1), any_v4(), 7).unwrap();
        a.send_udp(SocketId(2), "127.0.0.1:7".parse().unwrap(), Bytes::from_static(b"echo"), 0, t(0))
            .unwrap();

        let got = a.take_received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data_bytes(), Bytes::from_static(b"echo"));
        assert_eq!(a.stats.looped_back, 1);
        assert_eq!(a.queued_frames(a.interface_id("eth0").unwrap()), 0);
    }

    #[test]
    fn raw_socket_gets_a_copy_and_a_close_indication() {
        let mut net = Net::preferred();
        net.nodes[HOST_B].udp_bind(SocketId(1), any_v4(), 5000).unwrap();
        net.nodes[HOST_B]
            .raw_bind(SocketId(50), Some(protocol::UDP), any_v4(), t(0))
            .unwrap();
        net.nodes[HOST_A]
            .send_udp(SocketId(7), "10.0.1.2:5000".parse().unwrap(), Bytes::from_static(b"raw"), 0, t(0))
            .unwrap();
        net.pump(t(0));

        let got = net.nodes[HOST_B].take_received();
        assert_eq!(got.len(), 2);
        assert!(got
            .iter()
            .any(|p| p.find_tag::<SocketInd>() == Some(&SocketInd(SocketId(50)))));

        net.nodes[HOST_B].raw_close(SocketId(50), protocol::IPV4, t(0)).unwrap();
        let indications = net.nodes[HOST_B].take_indications();
        assert_eq!(indications.len(), 1);
        assert_eq!(indications[0].kind, SocketCommand::Closed);
    }

    #[test]
    fn corrupted_frames_are_dropped_by_the_fcs() {
        let mut net = Net::preferred();
        net.nodes[HOST_A]
            .send_udp(SocketId(7), "10.0.0.254:9".parse().unwrap(), Bytes::from_static(b"x"), 0, t(0))
            .unwrap();
        let eth0 = net.nodes[HOST_A].interface_id("eth0").unwrap();
        let frame = net.nodes[HOST_A].dequeue_frame(eth0, t(0)).unwrap();
        let router_eth0 = net.nodes[ROUTER].interface_id("eth0").unwrap();
        net.nodes[ROUTER].receive_frame(router_eth0, frame, true, t(0)).unwrap();

        let report = net.nodes[ROUTER].report();
        assert_eq!(report.ethernet.dropped.get(DropReason::IncorrectlyReceived), 1);
        assert_eq!(net.nodes[ROUTER].queued_frames(router_eth0), 0);
    }

    #[test]
    fn fifo_queue_overflows_without_red() {
        let mut config = MeridianConfig::default();
        config.ipv6.dad_delay_millis = 0;
        config.red.enabled = false;
        config.red.capacity = 2;
        let mut net = Net::build(&config);
        let dest: SocketAddr = "10.0.0.254:9".parse().unwrap();
        net.nodes[HOST_A].send_udp(SocketId(7), dest, Bytes::from_static(b"x"), 0, t(0)).unwrap();
        net.pump(t(0));

        for _ in 0..5 {
            net.nodes[HOST_A].send_udp(SocketId(7), dest, Bytes::from_static(b"x"), 0, t(1)).unwrap();
        }
        let eth0 = net.nodes[HOST_A].interface_id("eth0").unwrap();
        assert_eq!(net.nodes[HOST_A].queued_frames(eth0), 2);
        assert_eq!(net.nodes[HOST_A].stats.frames_dropped, 3);
    }

    #[test]
    fn report_serializes_every_layer() {
        let mut net = Net::preferred();
        net.nodes[HOST_A]
            .send_udp(SocketId(7), "10.0.1.2:5000".parse().unwrap(), Bytes::from_static(b"x"), 0, t(0))
            .unwrap();
        let json = serde_json::to_value(net.nodes[HOST_A].report()).unwrap();
        assert_eq!(json["name"], "host-a");
        assert_eq!(json["udp"]["sent"], 1);
        assert_eq!(json["ipv4"]["sent_from_upper"], 1);
        assert!(json["queues"]["eth0"]["red"].is_object());
    }

    #[test]
    fn unknown_route_interface_is_rejected() {
        let mut config = MeridianConfig::default();
        config.nodes[HOST_A].routes[0].interface = "eth9".to_string();
        let err = Node::from_config(&config.nodes[HOST_A], &config, 0).unwrap_err();
        assert!(matches!(err, NodeError::UnknownInterface { ref interface, .. } if interface == "eth9"));
    }

    #[test]
    fn bad_multicast_group_is_a_config_error() {
        let mut config = MeridianConfig::default();
        config.nodes[HOST_A].interfaces[0].multicast_groups = vec!["10.0.0.1".to_string()];
        assert!(matches!(
            Node::from_config(&config.nodes[HOST_A], &config, 0),
            Err(NodeError::Config(_))
        ));
    }
}
