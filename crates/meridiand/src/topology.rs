//! Nodes and the links between them, built from configuration, plus the
//! per-instant step that moves frames across the links.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use meridian_core::config::{parse_endpoint, MeridianConfig};
use meridian_core::{SimTime, SocketId};
use meridian_stack::node::{NodeError, NodeReport};
use meridian_stack::Node;

use crate::link::{Direction, Endpoint, Link, LinkStats};

/// Socket ids the daemon uses for receivers. Senders count up from 1.
const SINK_SOCKET_BASE: u32 = 1000;

/// Rounds of frame exchange within one instant before giving up.
const MAX_ROUNDS: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("node {name}: {source}")]
    Node {
        name: String,
        #[source]
        source: NodeError,
    },
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(String),
    #[error("endpoint {0:?} is already linked")]
    AlreadyLinked(String),
    #[error(transparent)]
    Config(#[from] meridian_core::config::ConfigError),
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub name: String,
    #[serde(flatten)]
    pub stats: LinkStats,
}

#[derive(Debug)]
pub struct Topology {
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
    rng: StdRng,
    next_sink: u32,
}

impl Topology {
    pub fn build(config: &MeridianConfig) -> Result<Self, TopologyError> {
        let seed = config.simulation.seed;
        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| {
                Node::from_config(n, config, seed.wrapping_add(i as u64 + 1)).map_err(|source| {
                    TopologyError::Node {
                        name: n.name.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut topology = Self {
            nodes,
            links: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            next_sink: SINK_SOCKET_BASE,
        };
        let mut linked: Vec<Endpoint> = Vec::new();
        for l in &config.links {
            let a = topology.endpoint(&l.a)?;
            let b = topology.endpoint(&l.b)?;
            for (end, name) in [(a, &l.a), (b, &l.b)] {
                if linked.contains(&end) {
                    return Err(TopologyError::AlreadyLinked(name.clone()));
                }
                linked.push(end);
            }
            topology.links.push(Link::new(l, a, b));
        }
        tracing::info!(
            nodes = topology.nodes.len(),
            links = topology.links.len(),
            "topology built"
        );
        Ok(topology)
    }

    fn endpoint(&self, s: &str) -> Result<Endpoint, TopologyError> {
        let (node_name, ifname) = parse_endpoint(s)?;
        let node = self
            .node_index(node_name)
            .ok_or_else(|| TopologyError::UnknownEndpoint(s.to_string()))?;
        let interface = self.nodes[node]
            .interface_id(ifname)
            .ok_or_else(|| TopologyError::UnknownEndpoint(s.to_string()))?;
        Ok(Endpoint { node, interface })
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name() == name)
    }

    /// The node that owns `address` on one of its interfaces.
    pub fn owner_of(&self, address: IpAddr) -> Option<usize> {
        self.nodes.iter().position(|n| {
            n.interfaces().iter().any(|i| match address {
                IpAddr::V4(a) => i.ipv4_address() == Some(a),
                IpAddr::V6(a) => i.has_ipv6(a),
            })
        })
    }

    /// Bind a receiving socket on `node` for `port` in the family of
    /// `address`. Returns the socket id.
    pub fn bind_sink(&mut self, node: usize, address: IpAddr, port: u16) -> Result<SocketId, TopologyError> {
        let socket = SocketId(self.next_sink);
        self.next_sink += 1;
        let any = match address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let n = &mut self.nodes[node];
        n.udp_bind(socket, any, port).map_err(|source| TopologyError::Node {
            name: n.name().to_string(),
            source,
        })?;
        tracing::debug!(node = %n.name(), socket = %socket, port, "sink bound");
        Ok(socket)
    }

    /// Move frames for instant `now`: start transmissions on idle channels
    /// and hand arrived frames to their receivers, repeating while anything
    /// moves so that zero-delay links settle within the instant.
    pub fn step(&mut self, now: SimTime) -> Result<(), TopologyError> {
        for _ in 0..MAX_ROUNDS {
            let mut moved = false;
            for l in 0..self.links.len() {
                for dir in Direction::BOTH {
                    moved |= self.pump(l, dir, now)?;
                }
            }
            if !moved {
                return Ok(());
            }
        }
        tracing::warn!(now = ?now, "links still busy after {MAX_ROUNDS} rounds");
        Ok(())
    }

    fn pump(&mut self, l: usize, dir: Direction, now: SimTime) -> Result<bool, TopologyError> {
        let (from, to) = self.links[l].ends(dir);
        let mut moved = false;
        while !self.links[l].is_busy(dir, now) {
            let Some(bytes) = self.nodes[from.node].dequeue_frame(from.interface, now) else {
                break;
            };
            self.links[l].transmit(dir, bytes, now, &mut self.rng);
            moved = true;
        }
        for frame in self.links[l].arrivals(dir, now) {
            let n = &mut self.nodes[to.node];
            n.receive_frame(to.interface, frame.bytes, frame.bit_error, now)
                .map_err(|source| TopologyError::Node {
                    name: n.name().to_string(),
                    source,
                })?;
            moved = true;
        }
        Ok(moved)
    }

    pub fn tick(&mut self, now: SimTime) -> Result<(), TopologyError> {
        for n in &mut self.nodes {
            n.tick(now).map_err(|source| TopologyError::Node {
                name: n.name().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        for n in &mut self.nodes {
            n.stop();
        }
    }

    pub fn node_reports(&self) -> Vec<NodeReport> {
        self.nodes.iter().map(Node::report).collect()
    }

    pub fn link_reports(&self) -> Vec<LinkReport> {
        self.links
            .iter()
            .map(|l| LinkReport {
                name: l.name.clone(),
                stats: l.stats.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn instant_links() -> MeridianConfig {
        let mut config = MeridianConfig::default();
        config.ipv6.dad_delay_millis = 0;
        for l in &mut config.links {
            l.delay_millis = 0;
        }
        config
    }

    #[test]
    fn default_topology_carries_a_datagram_end_to_end() {
        let config = instant_links();
        let mut topo = Topology::build(&config).unwrap();
        let b = topo.owner_of("10.0.1.2".parse().unwrap()).unwrap();
        topo.bind_sink(b, "10.0.1.2".parse().unwrap(), 5000).unwrap();
        let a = topo.node_index("host-a").unwrap();
        topo.nodes[a]
            .send_udp(SocketId(1), "10.0.1.2:5000".parse().unwrap(), Bytes::from_static(b"hi"), 0, Duration::ZERO)
            .unwrap();
        topo.step(Duration::ZERO).unwrap();

        assert_eq!(topo.nodes[b].take_received().len(), 1);
        assert!(topo.links.iter().all(|l| l.stats.frames > 0));
    }

    #[test]
    fn delayed_links_deliver_on_a_later_step() {
        let mut config = instant_links();
        for l in &mut config.links {
            l.delay_millis = 10;
        }
        let mut topo = Topology::build(&config).unwrap();
        let a = topo.node_index("host-a").unwrap();
        topo.nodes[a]
            .send_udp(SocketId(1), "10.0.0.254:9".parse().unwrap(), Bytes::from_static(b"hi"), 0, Duration::ZERO)
            .unwrap();
        topo.step(Duration::ZERO).unwrap();
        assert_eq!(topo.links[0].in_flight(), 1);
        topo.step(Duration::from_millis(10)).unwrap();
        assert_eq!(topo.links[0].in_flight(), 1, "arp reply now travelling back");
    }

    #[test]
    fn endpoint_linked_twice_is_rejected() {
        let mut config = MeridianConfig::default();
        let dup = config.links[0].clone();
        config.links.push(dup);
        assert!(matches!(
            Topology::build(&config),
            Err(TopologyError::AlreadyLinked(_))
        ));
    }

    #[test]
    fn owner_lookup_covers_both_families() {
        let topo = Topology::build(&MeridianConfig::default()).unwrap();
        assert_eq!(topo.owner_of("2001:db8:1::2".parse().unwrap()), topo.node_index("host-b"));
        assert_eq!(topo.owner_of("10.0.0.254".parse().unwrap()), topo.node_index("router"));
        assert_eq!(topo.owner_of("192.0.2.1".parse().unwrap()), None);
    }
}
