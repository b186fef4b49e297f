//! Datagrams parked while ARP resolves their next hop.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use meridian_core::{InterfaceId, Packet};

/// One FIFO per (egress interface, next hop).
#[derive(Debug, Default)]
pub struct PendingQueues {
    queues: HashMap<(InterfaceId, Ipv4Addr), VecDeque<Packet>>,
}

impl PendingQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interface: InterfaceId, next_hop: Ipv4Addr, packet: Packet) {
        tracing::debug!(
            packet = packet.name(),
            interface = %interface,
            next_hop = %next_hop,
            "pending arp resolution"
        );
        self.queues
            .entry((interface, next_hop))
            .or_default()
            .push_back(packet);
    }

    /// Everything waiting for `next_hop`, oldest first.
    pub fn take(&mut self, interface: InterfaceId, next_hop: Ipv4Addr) -> VecDeque<Packet> {
        self.queues
            .remove(&(interface, next_hop))
            .unwrap_or_default()
    }

    pub fn waiting_for(&self, interface: InterfaceId, next_hop: Ipv4Addr) -> usize {
        self.queues
            .get(&(interface, next_hop))
            .map_or(0, VecDeque::len)
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Discard every queue. Returns how many datagrams were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        self.queues.clear();
        n
    }
}
