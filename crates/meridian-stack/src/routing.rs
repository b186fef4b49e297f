//! Routing tables. The engines only see the lookup traits; the static
//! tables here are what the daemon and the tests plug in.

use std::net::{Ipv4Addr, Ipv6Addr};

use meridian_core::address::{ipv6_prefix_matches, netmask_from_prefix, Ipv4AddrExt};
use meridian_core::{InterfaceId, SimTime};

use crate::interface::InterfaceTable;

// ── IPv4 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Route {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    /// Unspecified for directly attached networks.
    pub gateway: Ipv4Addr,
    pub interface: InterfaceId,
    pub metric: u32,
}

impl Ipv4Route {
    pub fn matches(&self, dest: Ipv4Addr) -> bool {
        self.destination
            .same_subnet(dest, netmask_from_prefix(self.prefix_len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastOutput {
    pub interface: InterfaceId,
    /// Leaf networks only get traffic while a listener is present.
    pub leaf: bool,
    /// Forward only datagrams whose TTL exceeds this.
    pub ttl_threshold: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastRoute {
    pub origin: Ipv4Addr,
    pub origin_prefix_len: u8,
    pub group: Ipv4Addr,
    /// Reverse-path interface. `None` falls back to the interface of the
    /// unicast route towards the origin.
    pub input_interface: Option<InterfaceId>,
    pub outputs: Vec<MulticastOutput>,
}

impl MulticastRoute {
    fn matches(&self, origin: Ipv4Addr, group: Ipv4Addr) -> bool {
        (self.group.is_unspecified() || self.group == group)
            && self
                .origin
                .same_subnet(origin, netmask_from_prefix(self.origin_prefix_len))
    }
}

pub trait Ipv4RoutingTable: Send {
    /// Longest-prefix match, lowest metric on ties.
    fn best_matching_route(&self, dest: Ipv4Addr) -> Option<Ipv4Route>;

    fn best_multicast_route(&self, origin: Ipv4Addr, group: Ipv4Addr) -> Option<&MulticastRoute>;

    fn is_forwarding_enabled(&self) -> bool;

    fn is_multicast_forwarding_enabled(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIpv4RoutingTable {
    routes: Vec<Ipv4Route>,
    multicast_routes: Vec<MulticastRoute>,
    pub forwarding: bool,
    pub multicast_forwarding: bool,
}

impl StaticIpv4RoutingTable {
    pub fn new(forwarding: bool, multicast_forwarding: bool) -> Self {
        Self {
            forwarding,
            multicast_forwarding,
            ..Self::default()
        }
    }

    pub fn add_route(&mut self, route: Ipv4Route) {
        self.routes.push(route);
    }

    pub fn add_multicast_route(&mut self, route: MulticastRoute) {
        self.multicast_routes.push(route);
    }

    /// Directly attached subnet of every configured interface.
    pub fn add_interface_routes(&mut self, interfaces: &InterfaceTable) {
        for i in interfaces.iter() {
            if let Some(d) = &i.ipv4 {
                let netmask = netmask_from_prefix(d.prefix_len);
                self.routes.push(Ipv4Route {
                    destination: Ipv4Addr::from(u32::from(d.address) & u32::from(netmask)),
                    prefix_len: d.prefix_len,
                    gateway: Ipv4Addr::UNSPECIFIED,
                    interface: i.id,
                    metric: 0,
                });
            }
        }
    }

    pub fn routes(&self) -> &[Ipv4Route] {
        &self.routes
    }
}

impl Ipv4RoutingTable for StaticIpv4RoutingTable {
    fn best_matching_route(&self, dest: Ipv4Addr) -> Option<Ipv4Route> {
        self.routes
            .iter()
            .filter(|r| r.matches(dest))
            .min_by(|a, b| b.prefix_len.cmp(&a.prefix_len).then(a.metric.cmp(&b.metric)))
            .copied()
    }

    fn best_multicast_route(&self, origin: Ipv4Addr, group: Ipv4Addr) -> Option<&MulticastRoute> {
        self.multicast_routes
            .iter()
            .filter(|r| r.matches(origin, group))
            .max_by_key(|r| (!r.group.is_unspecified(), r.origin_prefix_len))
    }

    fn is_forwarding_enabled(&self) -> bool {
        self.forwarding
    }

    fn is_multicast_forwarding_enabled(&self) -> bool {
        self.multicast_forwarding
    }
}

// ── IPv6 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Route {
    pub destination: Ipv6Addr,
    pub prefix_len: u8,
    /// Unspecified for on-link prefixes.
    pub next_hop: Ipv6Addr,
    pub interface: InterfaceId,
    pub metric: u32,
    /// Routes learned at runtime lapse; configured ones never do.
    pub expires: Option<SimTime>,
}

impl Ipv6Route {
    pub fn matches(&self, dest: Ipv6Addr) -> bool {
        ipv6_prefix_matches(self.destination, self.prefix_len, dest)
    }

    fn is_expired(&self, now: SimTime) -> bool {
        self.expires.is_some_and(|at| now >= at)
    }
}

pub trait Ipv6RoutingTable: Send {
    fn best_matching_route(&self, dest: Ipv6Addr, now: SimTime) -> Option<Ipv6Route>;

    fn is_router(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIpv6RoutingTable {
    routes: Vec<Ipv6Route>,
    pub router: bool,
}

impl StaticIpv6RoutingTable {
    pub fn new(router: bool) -> Self {
        Self {
            routes: Vec::new(),
            router,
        }
    }

    pub fn add_route(&mut self, route: Ipv6Route) {
        self.routes.push(route);
    }

    /// On-link prefix of every configured global or link-local address.
    pub fn add_interface_routes(&mut self, interfaces: &InterfaceTable) {
        for i in interfaces.iter().filter(|i| !i.loopback) {
            for e in &i.ipv6 {
                let already = self
                    .routes
                    .iter()
                    .any(|r| r.interface == i.id && r.prefix_len == e.prefix_len && r.matches(e.address));
                if !already {
                    self.routes.push(Ipv6Route {
                        destination: e.address,
                        prefix_len: e.prefix_len,
                        next_hop: Ipv6Addr::UNSPECIFIED,
                        interface: i.id,
                        metric: 0,
                        expires: None,
                    });
                }
            }
        }
    }

    /// Drop lapsed routes. Returns how many were removed.
    pub fn purge_expired(&mut self, now: SimTime) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| !r.is_expired(now));
        before - self.routes.len()
    }
}

impl Ipv6RoutingTable for StaticIpv6RoutingTable {
    fn best_matching_route(&self, dest: Ipv6Addr, now: SimTime) -> Option<Ipv6Route> {
        self.routes
            .iter()
            .filter(|r| r.matches(dest) && !r.is_expired(now))
            .min_by(|a, b| b.prefix_len.cmp(&a.prefix_len).then(a.metric.cmp(&b.metric)))
            .copied()
    }

    fn is_router(&self) -> bool {
        self.router
    }
}
