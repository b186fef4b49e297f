use crate::*;

use std::net::Ipv6Addr;

use meridian_stack::DropReason;

const B6: &str = "[2001:db8:1::2]:5001";

fn bind_b6(net: &mut Net) {
    net.node(HOST_B).udp_bind(SocketId(1), any_v6(), 5001).unwrap();
}

/// The source fragments for its own small link MTU; fragments cross the
/// router untouched and reassemble at the destination.
#[test]
fn test_source_fragmentation_and_reassembly() {
    let mut config = preferred_config();
    interface_config(&mut config, HOST_A, "eth0").mtu = 1280;
    let mut net = Net::build(&config).unwrap();
    bind_b6(&mut net);

    net.send(HOST_A, 7, B6, &vec![0x66; 2000], t(0));
    net.pump(t(0));

    let got = net.received(HOST_B);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].len(), 2000);
    assert_eq!(net.node(HOST_A).ipv6().stats.fragments_created, 2);
    assert_eq!(net.node(ROUTER).ipv6().stats.forwarded, 2);
    assert_eq!(net.node(HOST_B).ipv6().stats.reassembled, 1);
    assert_eq!(net.node(HOST_B).ipv6().fragments_outstanding(), 0);
}

/// Routers never fragment: an oversized transit datagram draws packet
/// too big back to the source.
#[test]
fn test_router_answers_packet_too_big() {
    let mut config = preferred_config();
    interface_config(&mut config, ROUTER, "eth1").mtu = 1280;
    let mut net = Net::build(&config).unwrap();
    bind_b6(&mut net);

    net.send(HOST_A, 7, B6, &vec![0; 1400], t(0));
    net.pump(t(0));

    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(ROUTER).ipv6().stats.fragments_created, 0);
    assert_eq!(net.node(ROUTER).icmp().stats.errors_sent, 1);
    assert_eq!(net.node(HOST_A).icmp().stats.errors_received, 1);
}

#[test]
fn test_hop_limit_expiry_draws_time_exceeded() {
    let mut config = preferred_config();
    config.ipv6.default_hop_limit = 1;
    let mut net = Net::build(&config).unwrap();
    bind_b6(&mut net);

    net.send(HOST_A, 7, B6, b"short-lived", t(0));
    net.pump(t(0));

    assert!(net.received(HOST_B).is_empty());
    assert_eq!(
        net.node(ROUTER).ipv6().stats.dropped.get(DropReason::HopLimitReached),
        1
    );
    assert_eq!(net.node(HOST_A).icmp().stats.errors_received, 1);
}

/// Only host-a runs duplicate address detection, for `dad_delay_millis`.
fn tentative_host_a(dad_delay_millis: u64) -> MeridianConfig {
    let mut config = preferred_config();
    let host_a = config
        .nodes
        .iter_mut()
        .find(|n| n.name == HOST_A)
        .expect("host-a in the default topology");
    host_a.dad_delay_millis = Some(dad_delay_millis);
    config
}

/// A datagram sent from a tentative address waits for the address to be
/// preferred, then leaves on the next retry.
#[test]
fn test_tentative_source_retries_until_preferred() {
    let mut net = Net::build(&tentative_host_a(1500)).unwrap();
    bind_b6(&mut net);

    net.send(HOST_A, 7, B6, b"patient", t(0));
    net.pump(t(0));
    assert_eq!(net.node(HOST_A).ipv6().stats.tentative_requeued, 1);
    assert_eq!(net.node(HOST_A).ipv6().tentative_len(), 1);

    // Still tentative at one second, so the retry puts it back.
    net.tick(t(1000));
    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(HOST_A).ipv6().tentative_len(), 1);

    // Preferred from 1.5 s; the retry at two seconds sends it.
    net.tick(t(2000));
    assert_eq!(net.received(HOST_B), vec![Bytes::from_static(b"patient")]);
    assert_eq!(net.node(HOST_A).ipv6().tentative_len(), 0);
    assert_eq!(
        net.node(HOST_A).ipv6().stats.dropped.get(DropReason::TentativeAddress),
        0
    );
}

#[test]
fn test_tentative_source_gives_up_after_retry_limit() {
    let mut config = tentative_host_a(60_000);
    config.ipv6.tentative_retry_limit = 2;
    let mut net = Net::build(&config).unwrap();
    bind_b6(&mut net);

    net.send(HOST_A, 7, B6, b"never", t(0));
    net.pump(t(0));
    assert_eq!(net.node(HOST_A).ipv6().stats.tentative_requeued, 1);

    // Two retries are allowed; the third attempt drops it.
    for s in 1..=2 {
        net.tick(t(s * 1000));
        assert_eq!(net.node(HOST_A).ipv6().tentative_len(), 1);
    }
    net.tick(t(3000));
    net.tick(t(4000));

    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(HOST_A).ipv6().tentative_len(), 0);
    assert_eq!(
        net.node(HOST_A).ipv6().stats.dropped.get(DropReason::TentativeAddress),
        1
    );
}

/// The first datagram fills the destination cache; later ones reuse it.
#[test]
fn test_destination_cache_remembers_next_hop() {
    let mut net = Net::preferred();
    bind_b6(&mut net);
    let dest: Ipv6Addr = "2001:db8:1::2".parse().unwrap();
    assert!(net.node(HOST_A).ipv6().destination_cache().is_empty());

    net.send(HOST_A, 7, B6, b"one", t(0));
    net.pump(t(0));
    assert!(net.node(HOST_A).ipv6().destination_cache().lookup(dest, t(0)).is_some());

    net.send(HOST_A, 7, B6, b"two", t(1));
    net.pump(t(1));
    assert_eq!(net.received(HOST_B).len(), 2);
    assert_eq!(net.node(HOST_A).ipv6().destination_cache().len(), 1);
}

/// Link-local traffic reaches the neighbour and goes no further.
#[test]
fn test_link_local_neighbour_is_reachable() {
    let mut net = Net::preferred();
    net.node(ROUTER).udp_bind(SocketId(1), any_v6(), 7000).unwrap();
    let router_ll = net
        .node(ROUTER)
        .interfaces()
        .by_name("eth0")
        .and_then(|i| i.ipv6.iter().map(|e| e.address).find(|a| a.segments()[0] == 0xfe80))
        .expect("router eth0 has a link-local address");

    let dest = SocketAddr::new(IpAddr::V6(router_ll), 7000).to_string();
    net.send(HOST_A, 7, &dest, b"hello neighbour", t(0));
    net.pump(t(0));

    assert_eq!(net.received(ROUTER), vec![Bytes::from_static(b"hello neighbour")]);
    assert_eq!(net.node(ROUTER).ipv6().stats.forwarded, 0);
}

#[test]
fn test_ping6_across_the_router() {
    let mut net = Net::preferred();
    let dest: IpAddr = "2001:db8:1::2".parse().unwrap();
    net.node(HOST_A).ping(dest, 0x66, 1, Bytes::from_static(b"hello?"), t(0)).unwrap();
    net.pump(t(0));

    assert_eq!(net.node(HOST_B).icmp().stats.echo_replies_sent, 1);
    assert_eq!(net.node(HOST_A).icmp().stats.echo_replies_received, 1);
}
