//! Message dispatcher: routes packets and commands between the ports of
//! adjacent layers.
//!
//! Each port faces either up (a module above the dispatcher is attached) or
//! down. Registrations made on one side are announced to every port on the
//! other side, so a multi-homed stack learns about every protocol and
//! interface without explicit wiring. Lookup order for an arriving message
//! is socket id, then interface id, then protocol; the first registered key
//! wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use meridian_core::tags::{
    DispatchProtocolReq, InterfaceReq, PacketProtocolTag, ServicePrimitive, SocketInd, SocketReq,
};
use meridian_core::{InterfaceId, Packet, Protocol, SocketId, TagSet};

/// Protocol id registered by a port that accepts any protocol.
pub const ANY_PROTOCOL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

/// Which neighbour a port is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Upper,
    Lower,
}

impl PortSide {
    fn opposite(self) -> PortSide {
        match self {
            PortSide::Upper => PortSide::Lower,
            PortSide::Lower => PortSide::Upper,
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Socket operations carried as commands through the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    /// Receive datagrams of `protocol` (all if `None`) addressed to `local`
    /// (any if unspecified).
    Bind {
        protocol: Option<Protocol>,
        local: std::net::IpAddr,
    },
    /// Only receive datagrams from `remote`.
    Connect { remote: std::net::IpAddr },
    Close,
    /// Indication that a socket is gone; travels up.
    Closed,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub kind: SocketCommand,
    pub tags: TagSet,
}

impl Command {
    pub fn new(kind: SocketCommand) -> Self {
        Self {
            kind,
            tags: TagSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Packet(Packet),
    Command(Command),
}

impl Message {
    pub fn tags(&self) -> &TagSet {
        match self {
            Message::Packet(p) => &p.tags,
            Message::Command(c) => &c.tags,
        }
    }

    fn describe(&self) -> String {
        match self {
            Message::Packet(p) => format!("packet {:?}", p.name()),
            Message::Command(c) => format!("command {:?}", c.kind),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("port {0:?} is not attached")]
    UnknownPort(PortId),
    #[error("unknown socket {socket} for {message}")]
    UnknownSocket { socket: SocketId, message: String },
    #[error("unknown interface {interface} for {message}")]
    UnknownInterface {
        interface: InterfaceId,
        message: String,
    },
    #[error("unknown protocol {protocol} ({primitive:?}) for {message}")]
    UnknownProtocol {
        protocol: Protocol,
        primitive: ServicePrimitive,
        message: String,
    },
    #[error("{message} carries no socket, interface or protocol")]
    NoDispatchKey { message: String },
    #[error("{protocol} ({primitive:?}) already registered on {existing:?}, refusing {port:?}")]
    DuplicateProtocol {
        protocol: Protocol,
        primitive: ServicePrimitive,
        existing: PortId,
        port: PortId,
    },
    #[error("interface {interface} already registered on {existing:?}")]
    DuplicateInterface {
        interface: InterfaceId,
        existing: PortId,
    },
}

// ── Announcements ─────────────────────────────────────────────────────────────

/// A registration propagated to one port on the opposite side. The owner of
/// the dispatcher delivers it to whatever is attached there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    Protocol {
        port: PortId,
        protocol: Protocol,
        primitive: ServicePrimitive,
    },
    Interface {
        port: PortId,
        interface: InterfaceId,
    },
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

type ProtocolKey = (i32, ServicePrimitive);

#[derive(Debug, Default)]
pub struct MessageDispatcher {
    name: String,
    ports: BTreeMap<PortId, PortSide>,
    socket_to_port: HashMap<SocketId, PortId>,
    interface_to_port: HashMap<InterfaceId, PortId>,
    /// Protocols handled by modules above, keyed for indications.
    upper_protocols: HashMap<ProtocolKey, PortId>,
    /// Services offered by modules below, keyed for requests.
    lower_services: HashMap<ProtocolKey, PortId>,
    /// What each port has been told about.
    announced: HashMap<PortId, BTreeSet<ProtocolKey>>,
    announced_interfaces: HashMap<PortId, BTreeSet<InterfaceId>>,
}

impl MessageDispatcher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_port(&mut self, port: PortId, side: PortSide) {
        self.ports.insert(port, side);
    }

    fn side(&self, port: PortId) -> Result<PortSide, DispatchError> {
        self.ports
            .get(&port)
            .copied()
            .ok_or(DispatchError::UnknownPort(port))
    }

    fn ports_on(&self, side: PortSide) -> impl Iterator<Item = PortId> + '_ {
        self.ports
            .iter()
            .filter(move |(_, s)| **s == side)
            .map(|(p, _)| *p)
    }

    /// Record that `port` handles `protocol` for `primitive`, then announce
    /// it to every port on the opposite side. Registering the same protocol
    /// on the same port again is a no-op.
    pub fn register_protocol(
        &mut self,
        protocol: Protocol,
        port: PortId,
        primitive: ServicePrimitive,
    ) -> Result<Vec<Announcement>, DispatchError> {
        let side = self.side(port)?;
        let key = (protocol.id, primitive);
        let map = match side {
            PortSide::Upper => &mut self.upper_protocols,
            PortSide::Lower => &mut self.lower_services,
        };
        match map.get(&key) {
            Some(existing) if *existing == port => return Ok(Vec::new()),
            Some(existing) => {
                return Err(DispatchError::DuplicateProtocol {
                    protocol,
                    primitive,
                    existing: *existing,
                    port,
                })
            }
            None => {
                map.insert(key, port);
            }
        }
        tracing::debug!(
            dispatcher = %self.name,
            protocol = %protocol,
            primitive = ?primitive,
            port = port.0,
            "protocol registered"
        );
        let targets: Vec<PortId> = self.ports_on(side.opposite()).collect();
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            self.announced.entry(target).or_default().insert(key);
            out.push(Announcement::Protocol {
                port: target,
                protocol,
                primitive,
            });
        }
        Ok(out)
    }

    /// Record that `interface` is reached through `port` and announce it to
    /// the opposite side.
    pub fn register_interface(
        &mut self,
        interface: InterfaceId,
        port: PortId,
    ) -> Result<Vec<Announcement>, DispatchError> {
        let side = self.side(port)?;
        match self.interface_to_port.get(&interface) {
            Some(existing) if *existing == port => return Ok(Vec::new()),
            Some(existing) => {
                return Err(DispatchError::DuplicateInterface {
                    interface,
                    existing: *existing,
                })
            }
            None => {
                self.interface_to_port.insert(interface, port);
            }
        }
        tracing::debug!(dispatcher = %self.name, interface = %interface, port = port.0, "interface registered");
        let targets: Vec<PortId> = self.ports_on(side.opposite()).collect();
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            self.announced_interfaces.entry(target).or_default().insert(interface);
            out.push(Announcement::Interface {
                port: target,
                interface,
            });
        }
        Ok(out)
    }

    pub fn unregister_interface(&mut self, interface: InterfaceId) {
        self.interface_to_port.remove(&interface);
        for set in self.announced_interfaces.values_mut() {
            set.remove(&interface);
        }
    }

    pub fn unregister_socket(&mut self, socket: SocketId) {
        self.socket_to_port.remove(&socket);
    }

    /// True if `port` has been told that `protocol` is available.
    pub fn is_announced(&self, port: PortId, protocol: Protocol, primitive: ServicePrimitive) -> bool {
        self.announced
            .get(&port)
            .is_some_and(|set| set.contains(&(protocol.id, primitive)))
    }

    /// True if `port` has been told that `interface` is reachable.
    pub fn is_interface_announced(&self, port: PortId, interface: InterfaceId) -> bool {
        self.announced_interfaces
            .get(&port)
            .is_some_and(|set| set.contains(&interface))
    }

    pub fn socket_port(&self, socket: SocketId) -> Option<PortId> {
        self.socket_to_port.get(&socket).copied()
    }

    /// Pick the output port for `message` arriving on `in_port`.
    pub fn arrived(&mut self, message: &Message, in_port: PortId) -> Result<PortId, DispatchError> {
        let closing = matches!(
            message,
            Message::Command(Command {
                kind: SocketCommand::Closed,
                ..
            })
        );
        self.select(message.tags(), closing, || message.describe(), in_port)
    }

    /// [`arrived`](Self::arrived) for a packet the caller keeps.
    pub fn arrived_packet(&mut self, packet: &Packet, in_port: PortId) -> Result<PortId, DispatchError> {
        self.select(&packet.tags, false, || format!("packet {:?}", packet.name()), in_port)
    }

    fn select(
        &mut self,
        tags: &TagSet,
        closing: bool,
        describe: impl Fn() -> String,
        in_port: PortId,
    ) -> Result<PortId, DispatchError> {
        let from = self.side(in_port)?;

        // Sockets register the first time they are seen from above.
        if from == PortSide::Upper {
            if let Some(SocketReq(id)) = tags.find_tag::<SocketReq>() {
                self.socket_to_port.entry(*id).or_insert(in_port);
            }
        }

        let socket = match from {
            PortSide::Lower => tags.find_tag::<SocketInd>().map(|t| t.0),
            PortSide::Upper => None,
        };
        let interface = match from {
            PortSide::Upper => tags.find_tag::<InterfaceReq>().map(|t| t.0),
            PortSide::Lower => None,
        };
        let protocol = tags
            .find_tag::<DispatchProtocolReq>()
            .map(|req| (req.protocol, Self::primitive_of(req, tags, from)));

        if let Some(id) = socket {
            if let Some(port) = self.socket_to_port.get(&id).copied() {
                if closing {
                    self.socket_to_port.remove(&id);
                }
                return Ok(port);
            }
        }
        if let Some(id) = interface {
            if let Some(port) = self.interface_to_port.get(&id).copied() {
                return Ok(port);
            }
        }
        if let Some((proto, primitive)) = protocol {
            let map = match from {
                PortSide::Upper => &self.lower_services,
                PortSide::Lower => &self.upper_protocols,
            };
            let hit = map
                .get(&(proto.id, primitive))
                .or_else(|| map.get(&(ANY_PROTOCOL, primitive)));
            if let Some(port) = hit {
                return Ok(*port);
            }
        }

        let described = describe();
        tracing::warn!(dispatcher = %self.name, message = %described, "no registration matches");
        Err(match (socket, interface, protocol) {
            (Some(socket), _, _) => DispatchError::UnknownSocket {
                socket,
                message: described,
            },
            (None, Some(interface), _) => DispatchError::UnknownInterface {
                interface,
                message: described,
            },
            (None, None, Some((protocol, primitive))) => DispatchError::UnknownProtocol {
                protocol,
                primitive,
                message: described,
            },
            (None, None, None) => DispatchError::NoDispatchKey { message: described },
        })
    }

    /// An explicit primitive wins. Otherwise a packet whose outermost
    /// protocol is the dispatch target is an indication of it, and anything
    /// else is a request for the target's service.
    fn primitive_of(req: &DispatchProtocolReq, tags: &TagSet, from: PortSide) -> ServicePrimitive {
        if let Some(p) = req.primitive {
            return p;
        }
        match tags.find_tag::<PacketProtocolTag>() {
            Some(PacketProtocolTag(p)) if *p == req.protocol => ServicePrimitive::Indication,
            Some(_) => ServicePrimitive::Request,
            None => match from {
                PortSide::Upper => ServicePrimitive::Request,
                PortSide::Lower => ServicePrimitive::Indication,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::protocol;
    use meridian_core::tags::InterfaceInd;

    const UDP_PORT: PortId = PortId(0);
    const ICMP_PORT: PortId = PortId(1);
    const IPV4_PORT: PortId = PortId(10);
    const IPV6_PORT: PortId = PortId(11);

    fn tn() -> MessageDispatcher {
        let mut d = MessageDispatcher::new("tn");
        d.add_port(UDP_PORT, PortSide::Upper);
        d.add_port(ICMP_PORT, PortSide::Upper);
        d.add_port(IPV4_PORT, PortSide::Lower);
        d.add_port(IPV6_PORT, PortSide::Lower);
        d
    }

    fn packet_with(protocol: Protocol, dispatch: Protocol) -> Message {
        let mut p = Packet::new("p");
        p.set_tag(PacketProtocolTag(protocol));
        p.set_tag(DispatchProtocolReq {
            protocol: dispatch,
            primitive: None,
        });
        Message::Packet(p)
    }

    #[test]
    fn upper_registration_is_announced_to_every_lower_port() {
        let mut d = tn();
        let announced = d
            .register_protocol(protocol::UDP, UDP_PORT, ServicePrimitive::Indication)
            .unwrap();
        assert_eq!(announced.len(), 2);
        for port in [IPV4_PORT, IPV6_PORT] {
            assert!(d.is_announced(port, protocol::UDP, ServicePrimitive::Indication));
        }
        assert!(!d.is_announced(ICMP_PORT, protocol::UDP, ServicePrimitive::Indication));
    }

    #[test]
    fn duplicate_registration_on_another_port_fails() {
        let mut d = tn();
        d.register_protocol(protocol::UDP, UDP_PORT, ServicePrimitive::Indication)
            .unwrap();
        assert!(d
            .register_protocol(protocol::UDP, UDP_PORT, ServicePrimitive::Indication)
            .unwrap()
            .is_empty());
        assert!(matches!(
            d.register_protocol(protocol::UDP, ICMP_PORT, ServicePrimitive::Indication),
            Err(DispatchError::DuplicateProtocol { existing: UDP_PORT, .. })
        ));
    }

    #[test]
    fn primitive_is_inferred_from_packet_protocol() {
        let mut d = tn();
        d.register_protocol(protocol::UDP, UDP_PORT, ServicePrimitive::Indication)
            .unwrap();
        d.register_protocol(protocol::IPV4, IPV4_PORT, ServicePrimitive::Request)
            .unwrap();
        // Going down: udp payload asking for the ipv4 service.
        let down = packet_with(protocol::UDP, protocol::IPV4);
        assert_eq!(d.arrived(&down, UDP_PORT).unwrap(), IPV4_PORT);
        // Going up: udp datagram handed to udp.
        let up = packet_with(protocol::UDP, protocol::UDP);
        assert_eq!(d.arrived(&up, IPV4_PORT).unwrap(), UDP_PORT);
    }

    #[test]
    fn socket_wins_over_protocol() {
        let mut d = tn();
        d.register_protocol(protocol::ICMPV4, ICMP_PORT, ServicePrimitive::Indication)
            .unwrap();
        d.register_protocol(protocol::IPV4, IPV4_PORT, ServicePrimitive::Request)
            .unwrap();
        let mut bind = Command::new(SocketCommand::Close);
        bind.tags.set_tag(SocketReq(SocketId(7)));
        bind.tags.set_tag(DispatchProtocolReq::request(protocol::IPV4));
        assert_eq!(d.arrived(&Message::Command(bind), UDP_PORT).unwrap(), IPV4_PORT);
        assert_eq!(d.socket_port(SocketId(7)), Some(UDP_PORT));

        let Message::Packet(mut p) = packet_with(protocol::ICMPV4, protocol::ICMPV4) else {
            unreachable!()
        };
        p.set_tag(SocketInd(SocketId(7)));
        assert_eq!(d.arrived(&Message::Packet(p), IPV4_PORT).unwrap(), UDP_PORT);
    }

    #[test]
    fn closed_indication_unregisters_socket() {
        let mut d = tn();
        let mut p = Packet::new("first");
        p.set_tag(SocketReq(SocketId(3)));
        p.set_tag(InterfaceReq(InterfaceId(0)));
        d.register_interface(InterfaceId(0), IPV4_PORT).unwrap();
        d.arrived(&Message::Packet(p), UDP_PORT).unwrap();

        let mut closed = Command::new(SocketCommand::Closed);
        closed.tags.set_tag(SocketInd(SocketId(3)));
        assert_eq!(d.arrived(&Message::Command(closed), IPV4_PORT).unwrap(), UDP_PORT);
        assert_eq!(d.socket_port(SocketId(3)), None);
    }

    #[test]
    fn interface_wins_over_protocol_going_down() {
        let mut d = MessageDispatcher::new("nl");
        d.add_port(PortId(0), PortSide::Upper);
        d.add_port(PortId(100), PortSide::Lower);
        d.add_port(PortId(101), PortSide::Lower);
        d.register_protocol(protocol::ETHERNET_MAC, PortId(100), ServicePrimitive::Request)
            .unwrap();
        let announced = d.register_interface(InterfaceId(1), PortId(101)).unwrap();
        assert_eq!(
            announced,
            vec![Announcement::Interface {
                port: PortId(0),
                interface: InterfaceId(1)
            }]
        );
        assert!(d.is_interface_announced(PortId(0), InterfaceId(1)));
        assert!(!d.is_interface_announced(PortId(100), InterfaceId(1)));
        let Message::Packet(mut p) = packet_with(protocol::IPV4, protocol::ETHERNET_MAC) else {
            unreachable!()
        };
        p.set_tag(InterfaceReq(InterfaceId(1)));
        assert_eq!(d.arrived(&Message::Packet(p.clone()), PortId(0)).unwrap(), PortId(101));
        // Unknown interface falls through to the protocol map.
        p.set_tag(InterfaceReq(InterfaceId(9)));
        assert_eq!(d.arrived(&Message::Packet(p), PortId(0)).unwrap(), PortId(100));
    }

    #[test]
    fn wildcard_and_misses() {
        let mut d = tn();
        let miss = packet_with(protocol::TCP, protocol::TCP);
        assert!(matches!(
            d.arrived(&miss, IPV4_PORT),
            Err(DispatchError::UnknownProtocol { .. })
        ));
        d.register_protocol(
            Protocol {
                id: ANY_PROTOCOL,
                ..protocol::UDP
            },
            ICMP_PORT,
            ServicePrimitive::Indication,
        )
        .unwrap();
        assert_eq!(d.arrived(&miss, IPV4_PORT).unwrap(), ICMP_PORT);

        let mut bare = Packet::new("bare");
        bare.set_tag(InterfaceInd(InterfaceId(0)));
        assert!(matches!(
            d.arrived(&Message::Packet(bare), IPV4_PORT),
            Err(DispatchError::NoDispatchKey { .. })
        ));
        assert!(matches!(
            d.arrived(&miss, PortId(99)),
            Err(DispatchError::UnknownPort(_))
        ));
    }
}
