use crate::*;

use meridian_stack::DropReason;

const ECT0: u8 = 2;

/// RED with an instantaneous average, so the decision for each frame
/// follows the queue length it sees: below 2 send, at 2 the probability
/// is still zero, from 3 on every frame is selected.
fn eager_red() -> MeridianConfig {
    let mut config = preferred_config();
    config.red.enabled = true;
    config.red.capacity = 50;
    config.red.min_threshold = 2.0;
    config.red.max_threshold = 4.0;
    config.red.max_probability = 1.0;
    config.red.weight = 1.0;
    config.red.use_ecn = true;
    config
}

/// Resolve ARP along the path so later bursts queue only data frames.
fn warmed_up(config: &MeridianConfig) -> Net {
    let mut net = Net::build(config).unwrap();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();
    net.send(HOST_A, 7, "10.0.1.2:5000", b"warm-up", t(0));
    net.pump(t(0));
    assert_eq!(net.received(HOST_B).len(), 1);
    net
}

fn burst(net: &mut Net, n: usize, ecn: u8) {
    for i in 0..n {
        net.send_ecn(HOST_A, 7, "10.0.1.2:5000", format!("burst-{i}").as_bytes(), ecn, t(10));
    }
}

fn eth0_red(net: &mut Net) -> meridian_stack::red::RedStats {
    net.node(HOST_A)
        .report()
        .queues
        .get("eth0")
        .and_then(|q| q.red.clone())
        .expect("eth0 has a red queue")
}

/// ECN-capable datagrams are marked instead of dropped and all of them
/// arrive.
#[test]
fn test_ect_burst_is_marked_not_dropped() {
    let mut net = warmed_up(&eager_red());
    burst(&mut net, 8, ECT0);

    let red = eth0_red(&mut net);
    assert_eq!(red.marked, 5);
    assert_eq!(red.dropped.total(), 0);

    net.pump(t(10));
    assert_eq!(net.received(HOST_B).len(), 8);
}

/// The same burst without ECN loses every frame RED selects.
#[test]
fn test_non_ect_burst_is_dropped_early() {
    let mut net = warmed_up(&eager_red());
    burst(&mut net, 8, 0);

    let red = eth0_red(&mut net);
    assert_eq!(red.marked, 0);
    assert_eq!(red.dropped.get(DropReason::Congestion), 5);

    net.pump(t(10));
    assert_eq!(net.received(HOST_B).len(), 3);
}

/// With ECN marking disabled even ECN-capable frames are dropped.
#[test]
fn test_ecn_disabled_drops_ect_frames() {
    let mut config = eager_red();
    config.red.use_ecn = false;
    let mut net = warmed_up(&config);
    burst(&mut net, 8, ECT0);

    let red = eth0_red(&mut net);
    assert_eq!(red.marked, 0);
    assert_eq!(red.dropped.get(DropReason::Congestion), 5);
}

/// The hard limit applies regardless of the average.
#[test]
fn test_capacity_overflow() {
    let mut config = eager_red();
    config.red.capacity = 4;
    config.red.min_threshold = 100.0;
    config.red.max_threshold = 200.0;
    let mut net = warmed_up(&config);
    burst(&mut net, 10, ECT0);

    let red = eth0_red(&mut net);
    assert_eq!(red.dropped.get(DropReason::QueueOverflow), 6);
    let eth0 = net.node(HOST_A).interface_id("eth0").unwrap();
    assert_eq!(net.node(HOST_A).queued_frames(eth0), 4);
}
