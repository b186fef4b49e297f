//! Destination cache: where the last datagram to a destination went.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use meridian_core::{InterfaceId, SimTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationEntry {
    pub next_hop: Ipv6Addr,
    pub interface: InterfaceId,
    pub expires: SimTime,
}

#[derive(Debug, Default)]
pub struct DestinationCache {
    entries: HashMap<Ipv6Addr, DestinationEntry>,
}

impl DestinationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A live entry for `dest`. Expired entries are treated as absent.
    pub fn lookup(&self, dest: Ipv6Addr, now: SimTime) -> Option<DestinationEntry> {
        self.entries
            .get(&dest)
            .filter(|e| now < e.expires)
            .copied()
    }

    pub fn insert(&mut self, dest: Ipv6Addr, entry: DestinationEntry) {
        self.entries.insert(dest, entry);
    }

    pub fn invalidate(&mut self, dest: Ipv6Addr) -> bool {
        self.entries.remove(&dest).is_some()
    }

    /// Drop expired entries. Returns how many went.
    pub fn purge(&mut self, now: SimTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
