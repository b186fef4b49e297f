use crate::*;

use meridian_core::protocol;
use meridian_core::tags::{
    DispatchProtocolReq, InterfaceReq, PacketProtocolTag, ServicePrimitive, SocketInd, SocketReq,
};
use meridian_core::Packet;
use meridian_stack::dispatcher::{Announcement, Command, SocketCommand};
use meridian_stack::{DispatchError, DropReason, Message, MessageDispatcher, PortId, PortSide};

// Transport/network dispatcher ports.
const UDP: PortId = PortId(0);
const RAW: PortId = PortId(2);
const TN_V4: PortId = PortId(10);
const TN_V6: PortId = PortId(11);

// Network/link dispatcher ports.
const NL_V4: PortId = PortId(20);
const NL_V6: PortId = PortId(21);
const ETH0: PortId = PortId(30);
const ETH1: PortId = PortId(31);

/// Two dispatchers stacked the way a node wires them, with every
/// registration made.
fn stack() -> (MessageDispatcher, MessageDispatcher) {
    let mut tn = MessageDispatcher::new("tn");
    for (port, side) in [
        (UDP, PortSide::Upper),
        (RAW, PortSide::Upper),
        (TN_V4, PortSide::Lower),
        (TN_V6, PortSide::Lower),
    ] {
        tn.add_port(port, side);
    }
    tn.register_protocol(protocol::UDP, UDP, ServicePrimitive::Indication)
        .unwrap();
    tn.register_protocol(protocol::IPV4, TN_V4, ServicePrimitive::Request)
        .unwrap();
    tn.register_protocol(protocol::IPV6, TN_V6, ServicePrimitive::Request)
        .unwrap();

    let mut nl = MessageDispatcher::new("nl");
    for (port, side) in [
        (NL_V4, PortSide::Upper),
        (NL_V6, PortSide::Upper),
        (ETH0, PortSide::Lower),
        (ETH1, PortSide::Lower),
    ] {
        nl.add_port(port, side);
    }
    nl.register_protocol(protocol::IPV4, NL_V4, ServicePrimitive::Indication)
        .unwrap();
    nl.register_protocol(protocol::IPV6, NL_V6, ServicePrimitive::Indication)
        .unwrap();
    nl.register_interface(InterfaceId(1), ETH0).unwrap();
    nl.register_interface(InterfaceId(2), ETH1).unwrap();
    (tn, nl)
}

fn udp_packet(name: &str) -> Packet {
    let mut p = Packet::new(name);
    p.set_tag(PacketProtocolTag(protocol::UDP));
    p
}

/// Registrations on one side are announced to every port on the other.
#[test]
fn test_registrations_reach_the_opposite_side() {
    let (tn, nl) = stack();
    for port in [TN_V4, TN_V6] {
        assert!(tn.is_announced(port, protocol::UDP, ServicePrimitive::Indication));
    }
    assert!(tn.is_announced(UDP, protocol::IPV6, ServicePrimitive::Request));
    assert!(nl.is_announced(ETH1, protocol::IPV4, ServicePrimitive::Indication));
    assert!(!nl.is_announced(NL_V4, protocol::IPV4, ServicePrimitive::Indication));
    for port in [NL_V4, NL_V6] {
        assert!(nl.is_interface_announced(port, InterfaceId(1)));
        assert!(nl.is_interface_announced(port, InterfaceId(2)));
    }
    assert!(!nl.is_interface_announced(ETH0, InterfaceId(2)));

    let mut fresh = MessageDispatcher::new("fresh");
    fresh.add_port(PortId(1), PortSide::Upper);
    fresh.add_port(PortId(2), PortSide::Lower);
    fresh.add_port(PortId(3), PortSide::Lower);
    let announced = fresh
        .register_interface(InterfaceId(7), PortId(2))
        .unwrap();
    assert_eq!(
        announced,
        vec![Announcement::Interface {
            port: PortId(1),
            interface: InterfaceId(7),
        }]
    );
    assert!(fresh.is_interface_announced(PortId(1), InterfaceId(7)));
    fresh.unregister_interface(InterfaceId(7));
    assert!(!fresh.is_interface_announced(PortId(1), InterfaceId(7)));
}

/// A datagram goes down by protocol, then by interface, and comes back up
/// by inferred indication.
#[test]
fn test_datagram_crosses_both_dispatchers() {
    let (mut tn, mut nl) = stack();

    let mut down = udp_packet("down");
    down.set_tag(DispatchProtocolReq::request(protocol::IPV6));
    assert_eq!(tn.arrived_packet(&down, UDP).unwrap(), TN_V6);

    down.set_tag(InterfaceReq(InterfaceId(2)));
    assert_eq!(nl.arrived_packet(&down, NL_V6).unwrap(), ETH1);

    let mut up = Packet::new("up");
    up.set_tag(PacketProtocolTag(protocol::IPV4));
    up.set_tag(DispatchProtocolReq {
        protocol: protocol::IPV4,
        primitive: None,
    });
    assert_eq!(nl.arrived_packet(&up, ETH0).unwrap(), NL_V4);

    let mut up = udp_packet("up");
    up.set_tag(DispatchProtocolReq {
        protocol: protocol::UDP,
        primitive: None,
    });
    assert_eq!(tn.arrived_packet(&up, TN_V4).unwrap(), UDP);
}

/// A socket opened from above gets its traffic ahead of the protocol
/// owner, until the closed indication passes back up.
#[test]
fn test_socket_registration_lives_until_closed() {
    let (mut tn, _) = stack();
    let socket = SocketId(9);

    let mut bind = Command::new(SocketCommand::Bind {
        protocol: Some(protocol::UDP),
        local: any_v6(),
    });
    bind.tags.set_tag(SocketReq(socket));
    bind.tags.set_tag(DispatchProtocolReq::request(protocol::IPV6));
    assert_eq!(tn.arrived(&Message::Command(bind), RAW).unwrap(), TN_V6);
    assert_eq!(tn.socket_port(socket), Some(RAW));

    let mut copy = udp_packet("copy");
    copy.set_tag(DispatchProtocolReq::indication(protocol::UDP));
    copy.set_tag(SocketInd(socket));
    assert_eq!(tn.arrived_packet(&copy, TN_V6).unwrap(), RAW);

    let mut closed = Command::new(SocketCommand::Closed);
    closed.tags.set_tag(SocketInd(socket));
    assert_eq!(tn.arrived(&Message::Command(closed), TN_V6).unwrap(), RAW);
    assert_eq!(tn.socket_port(socket), None);

    // Without the protocol fallback the stale socket id is an error.
    let mut stale = Packet::new("stale");
    stale.set_tag(SocketInd(socket));
    assert!(matches!(
        tn.arrived_packet(&stale, TN_V6),
        Err(DispatchError::UnknownSocket { socket: s, .. }) if s == socket
    ));
}

#[test]
fn test_unregistered_keys_are_errors() {
    let (mut tn, mut nl) = stack();

    let mut tcp = Packet::new("tcp");
    tcp.set_tag(DispatchProtocolReq::indication(protocol::TCP));
    assert!(matches!(
        tn.arrived_packet(&tcp, TN_V4),
        Err(DispatchError::UnknownProtocol { .. })
    ));

    let mut eth9 = udp_packet("eth9");
    eth9.set_tag(InterfaceReq(InterfaceId(9)));
    assert!(matches!(
        nl.arrived_packet(&eth9, NL_V4),
        Err(DispatchError::UnknownInterface { .. })
    ));

    assert!(matches!(
        tn.arrived_packet(&Packet::new("bare"), UDP),
        Err(DispatchError::NoDispatchKey { .. })
    ));
    assert!(matches!(
        tn.arrived_packet(&Packet::new("nowhere"), PortId(99)),
        Err(DispatchError::UnknownPort(PortId(99)))
    ));
    assert!(matches!(
        nl.register_interface(InterfaceId(1), ETH1),
        Err(DispatchError::DuplicateInterface { .. })
    ));
}

// ── Raw sockets on a node ─────────────────────────────────────────────────────

fn raw_copies(net: &mut Net, node: &str, socket: SocketId) -> usize {
    net.node(node)
        .take_received()
        .iter()
        .filter(|p| p.find_tag::<SocketInd>() == Some(&SocketInd(socket)))
        .count()
}

/// An ICMPv6 raw socket sees echo requests addressed to it until closed.
#[test]
fn test_ipv6_raw_socket_sees_echo_until_closed() {
    let mut net = Net::preferred();
    let raw = SocketId(60);
    let host_b: IpAddr = "2001:db8:1::2".parse().unwrap();
    net.node(HOST_B)
        .raw_bind(raw, Some(protocol::ICMPV6), host_b, t(0))
        .unwrap();
    assert_eq!(net.node(HOST_B).ipv6().raw_sockets().len(), 1);

    net.node(HOST_A).ping(host_b, 1, 1, Bytes::from_static(b"seen"), t(0)).unwrap();
    net.pump(t(0));
    assert!(raw_copies(&mut net, HOST_B, raw) >= 1);
    assert_eq!(net.node(HOST_A).icmp().stats.echo_replies_received, 1);

    net.node(HOST_B).raw_close(raw, protocol::IPV6, t(1)).unwrap();
    let indications = net.node(HOST_B).take_indications();
    assert_eq!(indications.len(), 1);
    assert_eq!(indications[0].kind, SocketCommand::Closed);
    assert!(net.node(HOST_B).ipv6().raw_sockets().is_empty());

    net.node(HOST_A).ping(host_b, 1, 2, Bytes::from_static(b"unseen"), t(1)).unwrap();
    net.pump(t(1));
    assert_eq!(raw_copies(&mut net, HOST_B, raw), 0);
    assert_eq!(net.node(HOST_A).icmp().stats.echo_replies_received, 2);
}

/// A raw socket bound to every protocol copies UDP traffic that no UDP
/// socket takes.
#[test]
fn test_raw_socket_without_protocol_filter_takes_udp_copies() {
    let mut net = Net::preferred();
    let raw = SocketId(61);
    net.node(HOST_B).raw_bind(raw, None, any_v4(), t(0)).unwrap();

    net.send(HOST_A, 7, "10.0.1.2:6000", b"nobody listens", t(0));
    net.pump(t(0));

    assert_eq!(raw_copies(&mut net, HOST_B, raw), 1);
    assert_eq!(net.node(HOST_B).udp().stats.dropped.get(DropReason::NoPortFound), 1);
}
