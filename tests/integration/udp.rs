use crate::*;

use meridian_core::tags::{L4PortInd, SocketInd};
use meridian_stack::node::NodeError;
use meridian_stack::udp::UdpError;
use meridian_stack::DropReason;

fn bind_b(net: &mut Net, socket: u32, port: u16) {
    net.node(HOST_B)
        .udp_bind(SocketId(socket), any_v4(), port)
        .unwrap_or_else(|e| panic!("bind {port} failed: {e}"));
}

/// Port 0 picks distinct ports from the ephemeral range, and the receiver
/// sees the chosen one as the source port.
#[test]
fn test_ephemeral_ports_come_from_the_range() {
    let mut net = Net::preferred();
    bind_b(&mut net, 1, 5000);

    let first = net.node(HOST_A).udp_bind(SocketId(3), any_v4(), 0).unwrap();
    let second = net.node(HOST_A).udp_bind(SocketId(4), any_v4(), 0).unwrap();
    assert!((1024..5000).contains(&first));
    assert!((1024..5000).contains(&second));
    assert_ne!(first, second);

    net.send(HOST_A, 3, "10.0.1.2:5000", b"from ephemeral", t(0));
    net.pump(t(0));

    let got = net.node(HOST_B).take_received();
    assert_eq!(got.len(), 1);
    let ports = got[0].find_tag::<L4PortInd>().expect("port indication");
    assert_eq!(ports.src_port, first);
    assert_eq!(ports.dest_port, 5000);
}

#[test]
fn test_conflicting_binds_are_rejected() {
    let mut net = Net::preferred();
    bind_b(&mut net, 1, 5000);
    let b = net.node(HOST_B);

    assert!(matches!(
        b.udp_bind(SocketId(2), any_v4(), 5000),
        Err(NodeError::Udp(UdpError::AddressInUse { port: 5000, .. }))
    ));
    assert!(matches!(
        b.udp_bind(SocketId(1), any_v4(), 5001),
        Err(NodeError::Udp(UdpError::AlreadyBound(SocketId(1))))
    ));

    // Distinct specific addresses may share a port.
    b.udp_bind(SocketId(3), "10.0.1.2".parse().unwrap(), 6000).unwrap();
    b.udp_bind(SocketId(4), "127.0.0.1".parse().unwrap(), 6000).unwrap();
    assert!(b.udp_bind(SocketId(5), any_v4(), 6000).is_err());
}

/// A connected socket only accepts datagrams from its peer; anything else
/// is unreachable.
#[test]
fn test_connected_socket_ignores_other_peers() {
    let mut net = Net::preferred();
    bind_b(&mut net, 1, 5000);
    let host_a: IpAddr = "10.0.0.1".parse().unwrap();
    net.node(HOST_B).udp_connect(SocketId(1), host_a, 4000).unwrap();
    net.node(HOST_A).udp_bind(SocketId(7), any_v4(), 4000).unwrap();

    net.send(HOST_A, 7, "10.0.1.2:5000", b"from the peer", t(0));
    net.send(HOST_A, 8, "10.0.1.2:5000", b"from a stranger", t(0));
    net.pump(t(0));

    assert_eq!(net.received(HOST_B), vec![Bytes::from_static(b"from the peer")]);
    assert_eq!(net.node(HOST_B).udp().stats.dropped.get(DropReason::NoPortFound), 1);
    assert_eq!(net.node(HOST_A).icmp().stats.errors_received, 1);
}

#[test]
fn test_connect_needs_a_full_remote() {
    let mut net = Net::preferred();
    let b = net.node(HOST_B);
    assert!(matches!(
        b.udp_connect(SocketId(1), any_v4(), 4000),
        Err(NodeError::Udp(UdpError::UnspecifiedRemote))
    ));
    assert!(matches!(
        b.udp_connect(SocketId(1), "10.0.0.1".parse().unwrap(), 0),
        Err(NodeError::Udp(UdpError::InvalidRemotePort(0)))
    ));
}

/// Closing frees the port: traffic to it is refused until another socket
/// binds it.
#[test]
fn test_close_frees_the_port() {
    let mut net = Net::preferred();
    bind_b(&mut net, 1, 5000);
    net.node(HOST_B).udp_close(SocketId(1)).unwrap();
    assert!(matches!(
        net.node(HOST_B).udp_close(SocketId(1)),
        Err(NodeError::Udp(UdpError::UnknownSocket(SocketId(1))))
    ));

    net.send(HOST_A, 7, "10.0.1.2:5000", b"refused", t(0));
    net.pump(t(0));
    assert!(net.received(HOST_B).is_empty());
    assert_eq!(net.node(HOST_B).icmp().stats.errors_sent, 1);

    bind_b(&mut net, 2, 5000);
    net.send(HOST_A, 7, "10.0.1.2:5000", b"accepted", t(1));
    net.pump(t(1));
    let got = net.node(HOST_B).take_received();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data_bytes(), Bytes::from_static(b"accepted"));
    assert_eq!(got[0].find_tag::<SocketInd>(), Some(&SocketInd(SocketId(2))));
}

/// A wildcard binding covers both families, so it conflicts with the
/// other family's wildcard and receives either family's traffic.
#[test]
fn test_wildcard_socket_spans_families() {
    let mut net = Net::preferred();
    bind_b(&mut net, 1, 5000);
    assert!(net.node(HOST_B).udp_bind(SocketId(2), any_v6(), 5000).is_err());

    net.node(HOST_B).udp_close(SocketId(1)).unwrap();
    net.node(HOST_B).udp_bind(SocketId(2), any_v6(), 5000).unwrap();
    net.send(HOST_A, 7, "[2001:db8:1::2]:5000", b"six", t(0));
    net.send(HOST_A, 8, "10.0.1.2:5000", b"four", t(0));
    net.pump(t(0));

    let mut got = net.received(HOST_B);
    got.sort();
    assert_eq!(got, vec![Bytes::from_static(b"four"), Bytes::from_static(b"six")]);
}
