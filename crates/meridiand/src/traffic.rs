//! Periodic UDP senders and the sinks that count what they deliver.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use meridian_core::config::TrafficConfig;
use meridian_core::{SimTime, SocketId};

use crate::topology::{Topology, TopologyError};

#[derive(Debug, thiserror::Error)]
pub enum TrafficError {
    #[error("traffic source {0:?} is not a node")]
    UnknownSource(String),
    #[error("traffic destination {0:?} is not an address")]
    BadDestination(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStats {
    pub from: String,
    pub to: SocketAddr,
    pub sent: u64,
    pub send_errors: u64,
}

#[derive(Debug)]
struct Generator {
    node: usize,
    socket: SocketId,
    dest: SocketAddr,
    payload: Bytes,
    ecn: u8,
    interval: Duration,
    remaining: Option<u64>,
    next: SimTime,
    stats: FlowStats,
}

#[derive(Debug)]
pub struct Traffic {
    generators: Vec<Generator>,
}

impl Traffic {
    /// Create one generator per flow, and bind a sink on whichever node
    /// owns the destination so delivered datagrams are not answered with
    /// port unreachable. Destinations owned by no node are still sent to.
    pub fn build(flows: &[TrafficConfig], topology: &mut Topology) -> Result<Self, TrafficError> {
        let mut generators = Vec::with_capacity(flows.len());
        let mut sinks: Vec<(usize, bool, u16)> = Vec::new();
        for (i, flow) in flows.iter().enumerate() {
            let node = topology
                .node_index(&flow.from)
                .ok_or_else(|| TrafficError::UnknownSource(flow.from.clone()))?;
            let address: IpAddr = flow
                .to
                .parse()
                .map_err(|_| TrafficError::BadDestination(flow.to.clone()))?;
            let dest = SocketAddr::new(address, flow.dest_port);

            if let Some(owner) = topology.owner_of(address) {
                let key = (owner, address.is_ipv6(), flow.dest_port);
                if !sinks.contains(&key) {
                    topology.bind_sink(owner, address, flow.dest_port)?;
                    sinks.push(key);
                }
            }

            generators.push(Generator {
                node,
                socket: SocketId(i as u32 + 1),
                dest,
                payload: Bytes::from(vec![0u8; flow.payload_bytes]),
                ecn: flow.ecn,
                interval: Duration::from_millis(flow.interval_millis.max(1)),
                remaining: (flow.count > 0).then_some(flow.count),
                next: SimTime::ZERO,
                stats: FlowStats {
                    from: flow.from.clone(),
                    to: dest,
                    sent: 0,
                    send_errors: 0,
                },
            });
        }
        Ok(Self { generators })
    }

    /// Send every datagram due by `now`.
    /// Send every datagram due by `now`. Per-datagram failures are counted;
    /// a fatal node error stops the run.
    pub fn fire(&mut self, topology: &mut Topology, now: SimTime) -> Result<(), TrafficError> {
        for g in &mut self.generators {
            while g.next <= now && g.remaining != Some(0) {
                let node = &mut topology.nodes[g.node];
                match node.send_udp(g.socket, g.dest, g.payload.clone(), g.ecn, g.next) {
                    Ok(()) => g.stats.sent += 1,
                    Err(source) if source.is_fatal() => {
                        return Err(TopologyError::Node {
                            name: node.name().to_string(),
                            source,
                        }
                        .into());
                    }
                    Err(e) => {
                        g.stats.send_errors += 1;
                        tracing::warn!(node = %node.name(), dest = %g.dest, error = %e, "send failed");
                    }
                }
                if let Some(n) = g.remaining.as_mut() {
                    *n -= 1;
                }
                g.next += g.interval;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<FlowStats> {
        self.generators.iter().map(|g| g.stats.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::config::MeridianConfig;

    fn setup(count: u64) -> (Topology, Traffic) {
        let mut config = MeridianConfig::default();
        config.ipv6.dad_delay_millis = 0;
        for f in &mut config.traffic {
            f.count = count;
            f.interval_millis = 100;
        }
        let mut topo = Topology::build(&config).unwrap();
        let traffic = Traffic::build(&config.traffic, &mut topo).unwrap();
        (topo, traffic)
    }

    #[test]
    fn generators_respect_interval_and_count() {
        let (mut topo, mut traffic) = setup(3);
        traffic.fire(&mut topo, Duration::ZERO).unwrap();
        assert!(traffic.stats().iter().all(|s| s.sent == 1));
        traffic.fire(&mut topo, Duration::from_millis(250)).unwrap();
        assert!(traffic.stats().iter().all(|s| s.sent == 3));
        traffic.fire(&mut topo, Duration::from_secs(5)).unwrap();
        assert!(traffic.stats().iter().all(|s| s.sent == 3));
    }

    #[test]
    fn unlimited_flows_keep_sending() {
        let (mut topo, mut traffic) = setup(0);
        traffic.fire(&mut topo, Duration::from_secs(1)).unwrap();
        assert!(traffic.stats().iter().all(|s| s.sent == 11));
    }

    #[test]
    fn bad_flows_are_rejected() {
        let mut config = MeridianConfig::default();
        let mut topo = Topology::build(&config).unwrap();
        config.traffic[0].from = "nobody".into();
        assert!(matches!(
            Traffic::build(&config.traffic, &mut topo),
            Err(TrafficError::UnknownSource(_))
        ));
        config.traffic[0].from = "host-a".into();
        config.traffic[0].to = "host-b".into();
        assert!(matches!(
            Traffic::build(&config.traffic, &mut topo),
            Err(TrafficError::BadDestination(_))
        ));
    }
}
