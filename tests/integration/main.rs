//! Meridian integration test harness.
//!
//! Tests here build whole nodes from configuration and move serialized
//! frames between them by hand, so every datagram crosses the real wire
//! encoding: Ethernet FCS, IP headers and checksums, UDP.
//!
//!   cargo test --test integration
//!
//! Each test builds its own network. Nothing is shared between tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use meridian_core::config::{parse_endpoint, MeridianConfig};
use meridian_core::{InterfaceId, SimTime, SocketId};
use meridian_stack::Node;

mod dispatch;
mod ipv4;
mod ipv6;
mod red;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Node names in the default topology.
pub const HOST_A: &str = "host-a";
pub const ROUTER: &str = "router";
pub const HOST_B: &str = "host-b";

/// Rounds of frame exchange before `pump` gives up.
const PUMP_ROUNDS: usize = 200;

pub fn t(millis: u64) -> SimTime {
    Duration::from_millis(millis)
}

pub fn any_v4() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

pub fn any_v6() -> IpAddr {
    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap_or_else(|e| panic!("bad socket address {s:?}: {e}"))
}

type End = (usize, InterfaceId);

/// Nodes wired together by zero-delay links.
pub struct Net {
    pub nodes: Vec<Node>,
    links: Vec<(End, End)>,
}

impl Net {
    pub fn build(config: &MeridianConfig) -> Result<Self> {
        config.validate().context("test config is invalid")?;
        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                Node::from_config(n, config, i as u64 + 1)
                    .with_context(|| format!("failed to build node {}", n.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut net = Self {
            nodes,
            links: Vec::new(),
        };
        for l in &config.links {
            let a = net.end(&l.a)?;
            let b = net.end(&l.b)?;
            net.links.push((a, b));
        }
        Ok(net)
    }

    /// The default topology with every address already preferred.
    pub fn preferred() -> Self {
        Self::build(&preferred_config()).unwrap_or_else(|e| panic!("{e:#}"))
    }

    fn end(&self, s: &str) -> Result<End> {
        let (node, iface) = parse_endpoint(s)?;
        let idx = self.index(node)?;
        let id = self.nodes[idx]
            .interface_id(iface)
            .with_context(|| format!("{node} has no interface {iface}"))?;
        Ok((idx, id))
    }

    fn index(&self, name: &str) -> Result<usize> {
        match self.nodes.iter().position(|n| n.name() == name) {
            Some(i) => Ok(i),
            None => bail!("no node named {name}"),
        }
    }

    pub fn node(&mut self, name: &str) -> &mut Node {
        let i = self.index(name).unwrap_or_else(|e| panic!("{e}"));
        &mut self.nodes[i]
    }

    pub fn send(&mut self, from: &str, socket: u32, dest: &str, payload: &[u8], now: SimTime) {
        self.send_ecn(from, socket, dest, payload, 0, now);
    }

    pub fn send_ecn(&mut self, from: &str, socket: u32, dest: &str, payload: &[u8], ecn: u8, now: SimTime) {
        self.node(from)
            .send_udp(SocketId(socket), addr(dest), Bytes::copy_from_slice(payload), ecn, now)
            .unwrap_or_else(|e| panic!("send from {from} to {dest} failed: {e}"));
    }

    /// Move frames both ways on every link until nothing is queued.
    pub fn pump(&mut self, now: SimTime) {
        for _ in 0..PUMP_ROUNDS {
            let mut moved = false;
            for i in 0..self.links.len() {
                let (a, b) = self.links[i];
                for ((from, fi), (to, ti)) in [(a, b), (b, a)] {
                    while let Some(frame) = self.nodes[from].dequeue_frame(fi, now) {
                        self.nodes[to]
                            .receive_frame(ti, frame, false, now)
                            .unwrap_or_else(|e| panic!("receive failed: {e}"));
                        moved = true;
                    }
                }
            }
            if !moved {
                return;
            }
        }
        panic!("network never went quiet");
    }

    /// Run node timers at `now`, then pump.
    pub fn tick(&mut self, now: SimTime) {
        for n in &mut self.nodes {
            n.tick(now).unwrap_or_else(|e| panic!("tick failed: {e}"));
        }
        self.pump(now);
    }

    /// Payloads delivered on `node` since the last call.
    pub fn received(&mut self, node: &str) -> Vec<Bytes> {
        self.node(node)
            .take_received()
            .iter()
            .map(|p| p.data_bytes())
            .collect()
    }
}

/// Default topology, no duplicate address detection delay.
pub fn preferred_config() -> MeridianConfig {
    let mut config = MeridianConfig::default();
    config.ipv6.dad_delay_millis = 0;
    config
}

/// Find a named interface's config entry on a node.
pub fn interface_config<'a>(
    config: &'a mut MeridianConfig,
    node: &str,
    iface: &str,
) -> &'a mut meridian_core::config::InterfaceConfig {
    config
        .nodes
        .iter_mut()
        .find(|n| n.name == node)
        .and_then(|n| n.interfaces.iter_mut().find(|i| i.name == iface))
        .unwrap_or_else(|| panic!("{node}.{iface} not in config"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The default configuration builds and every link end resolves.
#[test]
fn test_default_topology_builds() {
    let net = Net::build(&MeridianConfig::default()).expect("default topology");
    assert_eq!(net.nodes.len(), 3);
    assert_eq!(net.links.len(), 2);
}

/// Both families cross the router in one pump.
#[test]
fn test_dual_stack_round_trip() {
    let mut net = Net::preferred();
    net.node(HOST_B).udp_bind(SocketId(1), any_v4(), 5000).unwrap();
    net.node(HOST_B).udp_bind(SocketId(2), any_v6(), 5001).unwrap();

    net.send(HOST_A, 10, "10.0.1.2:5000", b"four", t(0));
    net.send(HOST_A, 11, "[2001:db8:1::2]:5001", b"six", t(0));
    net.pump(t(0));

    let mut got = net.received(HOST_B);
    got.sort();
    assert_eq!(got, vec![Bytes::from_static(b"four"), Bytes::from_static(b"six")]);

    let json = serde_json::to_value(net.node(ROUTER).report()).unwrap();
    assert_eq!(json["ipv4"]["forwarded"], 1);
    assert_eq!(json["ipv6"]["forwarded"], 1);
}
