use crate::*;

use meridian_core::config::{MulticastOutputConfig, MulticastRouteConfig};
use meridian_core::{protocol, Packet};
use meridian_stack::node::NodeError;
use meridian_stack::{DropReason, EngineError, NetfilterHook, Node, Verdict};

/// Datagrams bigger than the router's egress MTU are fragmented there and
/// reassembled at the destination.
#[test]
fn test_router_fragments_for_small_mtu() {
    let mut config = preferred_config();
    let eth1 = interface_config(&mut config, ROUTER, "eth1");
    eth1.mtu = 576;
    eth1.ipv6.clear();
    let mut net = Net::build(&config).unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();

    let payload = vec![0x5a; 1200];
    net.send(HOST_A, 7, "10.0.1.2:5000", &payload, t(0));
    net.pump(t(0));

    let got = net.received(HOST_B);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].len(), 1200);
    assert!(got[0].iter().all(|b| *b == 0x5a));
    assert_eq!(net.node(ROUTER).ipv4().stats.fragments_created, 3);
    assert_eq!(net.node(HOST_B).ipv4().stats.reassembled, 1);
    assert_eq!(net.node(HOST_B).ipv4().fragments_outstanding(), 0);
}

/// An MTU that cannot carry a header is a configuration error, caught by
/// validation and, on a node built without it, returned from the send.
#[test]
fn test_mtu_too_small_is_fatal() {
    let mut config = preferred_config();
    interface_config(&mut config, HOST_A, "eth0").mtu = 24;
    assert!(Net::build(&config).is_err());

    let eth0 = interface_config(&mut config, HOST_A, "eth0");
    eth0.mtu = 1000;
    assert!(Net::build(&config).is_err(), "IPv6 needs 1280");

    interface_config(&mut config, HOST_A, "eth0").mtu = 24;
    let mut host_a = Node::from_config(&config.nodes[0], &config, 1).unwrap();
    let result = host_a.send_udp(SocketId(7), addr("10.0.1.2:5000"), Bytes::from(vec![0u8; 100]), 0, t(0));
    match result {
        Err(e @ NodeError::Engine(EngineError::MtuTooSmall { mtu: 24, .. })) => assert!(e.is_fatal()),
        other => panic!("expected MtuTooSmall, got {other:?}"),
    }
}

/// A TTL of one dies at the router, which answers with time exceeded.
#[test]
fn test_ttl_expiry_draws_time_exceeded() {
    let mut config = preferred_config();
    config.ipv4.default_ttl = 1;
    let mut net = Net::build(&config).unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();

    net.send(HOST_A, 7, "10.0.1.2:5000", b"short-lived", t(0));
    net.pump(t(0));

    assert!(net.received(HOST_B).is_empty());
    let router = net.node(ROUTER);
    assert_eq!(router.ipv4().stats.dropped.get(DropReason::HopLimitReached), 1);
    assert_eq!(router.icmp().stats.errors_sent, 1);
    assert_eq!(net.node(HOST_A).icmp().stats.errors_received, 1);
}

/// A host that does not forward drops transit traffic.
#[test]
fn test_forwarding_disabled_router_drops_transit() {
    let mut config = preferred_config();
    for n in &mut config.nodes {
        if n.name == ROUTER {
            n.forwarding = false;
        }
    }
    let mut net = Net::build(&config).unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();

    net.send(HOST_A, 7, "10.0.1.2:5000", b"blocked", t(0));
    net.pump(t(0));

    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(ROUTER).ipv4().stats.forwarded, 0);
    assert!(net.node(ROUTER).ipv4().stats.dropped.total() >= 1);
}

/// Multicast routes copy group traffic from eth0 onto eth1 while the TTL
/// allows it.
#[test]
fn test_multicast_route_forwards_group_traffic() {
    let mut config = preferred_config();
    config.ipv4.default_multicast_ttl = 4;
    for n in &mut config.nodes {
        if n.name == ROUTER {
            n.multicast_forwarding = true;
            n.multicast_routes = vec![MulticastRouteConfig {
                origin: "10.0.0.0/24".to_string(),
                group: "224.1.2.3".parse().unwrap(),
                input_interface: "eth0".to_string(),
                output_interfaces: vec![MulticastOutputConfig {
                    interface: "eth1".to_string(),
                    leaf: false,
                    ttl_threshold: 0,
                }],
            }];
        }
    }
    let mut net = Net::build(&config).unwrap();
    let group: IpAddr = "224.1.2.3".parse().unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 6000).unwrap();
    net.node(HOST_B)
        .join_multicast_group(SocketId(1), group, Some("eth0"))
        .unwrap();

    net.send(HOST_A, 7, "224.1.2.3:6000", b"to the group", t(0));
    net.pump(t(0));

    assert_eq!(net.received(HOST_B), vec![Bytes::from_static(b"to the group")]);
    assert_eq!(net.node(HOST_A).ipv4().stats.multicast, 1);
}

/// Without a multicast route the group stays on the sender's link.
#[test]
fn test_multicast_stays_on_link_without_route() {
    let mut net = Net::preferred();
    let group: IpAddr = "224.1.2.3".parse().unwrap();
    net.node(ROUTER).udp_bind(SocketId(1), any_v4(), 6000).unwrap();
    net.node(ROUTER)
        .join_multicast_group(SocketId(1), group, Some("eth0"))
        .unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 6000).unwrap();
    net.node(HOST_B)
        .join_multicast_group(SocketId(1), group, Some("eth0"))
        .unwrap();

    net.send(HOST_A, 7, "224.1.2.3:6000", b"local", t(0));
    net.pump(t(0));

    assert_eq!(net.received(ROUTER), vec![Bytes::from_static(b"local")]);
    assert!(net.received(HOST_B).is_empty());
}

struct Gate {
    verdict: Verdict,
}

impl NetfilterHook for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn forward(&mut self, _packet: &mut Packet) -> Verdict {
        self.verdict
    }
}

/// A forward hook that queues holds transit traffic until reinjected.
#[test]
fn test_forward_hook_queue_and_reinject() {
    let mut net = Net::preferred();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();
    net.node(ROUTER)
        .ipv4_mut()
        .hooks_mut()
        .register(0, Box::new(Gate { verdict: Verdict::Queue }));

    net.send(HOST_A, 7, "10.0.1.2:5000", b"held", t(0));
    net.pump(t(0));
    assert!(net.received(HOST_B).is_empty());

    let tickets = net.node(ROUTER).ipv4().hooks().queued_tickets();
    assert_eq!(tickets.len(), 1);
    assert!(net.node(ROUTER).reinject(protocol::IPV4, tickets[0], t(1)).unwrap());
    net.pump(t(1));

    assert_eq!(net.received(HOST_B), vec![Bytes::from_static(b"held")]);
    assert!(!net.node(ROUTER).reinject(protocol::IPV4, tickets[0], t(1)).unwrap());
}

/// A forward hook that drops counts the datagram as filtered.
#[test]
fn test_forward_hook_drop_is_counted() {
    let mut net = Net::preferred();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();
    let handle = net
        .node(ROUTER)
        .ipv4_mut()
        .hooks_mut()
        .register(0, Box::new(Gate { verdict: Verdict::Drop }));

    net.send(HOST_A, 7, "10.0.1.2:5000", b"dropped", t(0));
    net.pump(t(0));
    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(ROUTER).ipv4().stats.dropped.get(DropReason::Filtered), 1);

    assert!(net.node(ROUTER).ipv4_mut().hooks_mut().unregister(handle).is_some());
    net.send(HOST_A, 7, "10.0.1.2:5000", b"passes", t(1));
    net.pump(t(1));
    assert_eq!(net.received(HOST_B), vec![Bytes::from_static(b"passes")]);
}

#[test]
fn test_ping_across_the_router() {
    let mut net = Net::preferred();
    let dest: IpAddr = "10.0.1.2".parse().unwrap();
    net.node(HOST_A).ping(dest, 0x77, 1, Bytes::from_static(b"are you there"), t(0)).unwrap();
    net.pump(t(0));

    let b = net.node(HOST_B).icmp().stats.clone();
    assert_eq!(b.echo_requests_received, 1);
    assert_eq!(b.echo_replies_sent, 1);
    let a = net.node(HOST_A).icmp().stats.clone();
    assert_eq!(a.echo_requests_sent, 1);
    assert_eq!(a.echo_replies_received, 1);
}
