//! Interface table: the per-node list of network interfaces and their
//! IPv4/IPv6 configuration.

use std::net::{Ipv4Addr, Ipv6Addr};

use meridian_core::address::{netmask_from_prefix, ipv6_prefix_matches, Ipv4AddrExt, Ipv6AddrExt};
use meridian_core::{InterfaceId, MacAddress, SimTime};

pub const LOOPBACK_ID: InterfaceId = InterfaceId(0);

const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

// ── Addresses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4InterfaceData {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub multicast_groups: Vec<Ipv4Addr>,
}

impl Ipv4InterfaceData {
    pub fn netmask(&self) -> Ipv4Addr {
        netmask_from_prefix(self.prefix_len)
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.address.broadcast_for(self.netmask())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressState {
    /// Duplicate address detection still running; not usable as a source.
    Tentative { until: SimTime },
    Preferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6AddressEntry {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: AddressState,
}

impl Ipv6AddressEntry {
    pub fn is_tentative(&self) -> bool {
        matches!(self.state, AddressState::Tentative { .. })
    }
}

/// Modified EUI-64 link-local address for `mac` (RFC 4291 appendix A).
pub fn link_local_for(mac: MacAddress) -> Ipv6Addr {
    let m = mac.octets();
    Ipv6Addr::from([
        0xfe, 0x80, 0, 0, 0, 0, 0, 0,
        m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5],
    ])
}

/// ff02::1:ffXX:XXXX for `addr`.
pub fn solicited_node_for(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, o[13], o[14], o[15],
    ])
}

// ── Interface ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub id: InterfaceId,
    pub name: String,
    /// "node.interface", matched by broadcast globs.
    pub full_path: String,
    pub mac: MacAddress,
    /// 0 means unbounded.
    pub mtu: usize,
    pub loopback: bool,
    pub broadcast: bool,
    pub multicast: bool,
    pub point_to_point: bool,
    pub ipv4: Option<Ipv4InterfaceData>,
    pub ipv6: Vec<Ipv6AddressEntry>,
    pub ipv6_groups: Vec<Ipv6Addr>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, mac: MacAddress) -> Self {
        let name = name.into();
        Self {
            id: InterfaceId(u32::MAX),
            full_path: name.clone(),
            name,
            mac,
            mtu: 1500,
            loopback: false,
            broadcast: true,
            multicast: true,
            point_to_point: false,
            ipv4: None,
            ipv6: Vec::new(),
            ipv6_groups: Vec::new(),
        }
    }

    pub fn loopback() -> Self {
        let mut lo = Self::new("lo", MacAddress::UNSPECIFIED);
        lo.loopback = true;
        lo.broadcast = false;
        lo.mtu = 0;
        lo.ipv4 = Some(Ipv4InterfaceData {
            address: Ipv4Addr::LOCALHOST,
            prefix_len: 8,
            multicast_groups: Vec::new(),
        });
        lo.ipv6.push(Ipv6AddressEntry {
            address: Ipv6Addr::LOCALHOST,
            prefix_len: 128,
            state: AddressState::Preferred,
        });
        lo
    }

    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.ipv4.as_ref().map(|d| d.address)
    }

    pub fn ipv4_netmask(&self) -> Option<Ipv4Addr> {
        self.ipv4.as_ref().map(Ipv4InterfaceData::netmask)
    }

    /// True if this interface has joined `group`. 224.0.0.1 is implicit.
    pub fn is_member_v4(&self, group: Ipv4Addr) -> bool {
        group == Ipv4Addr::new(224, 0, 0, 1)
            || self
                .ipv4
                .as_ref()
                .is_some_and(|d| d.multicast_groups.contains(&group))
    }

    pub fn join_v4(&mut self, group: Ipv4Addr) {
        if let Some(d) = self.ipv4.as_mut() {
            if !d.multicast_groups.contains(&group) {
                d.multicast_groups.push(group);
            }
        }
    }

    pub fn leave_v4(&mut self, group: Ipv4Addr) {
        if let Some(d) = self.ipv4.as_mut() {
            d.multicast_groups.retain(|g| *g != group);
        }
    }

    pub fn add_ipv6(&mut self, address: Ipv6Addr, prefix_len: u8, state: AddressState) {
        if !self.ipv6.iter().any(|e| e.address == address) {
            self.ipv6.push(Ipv6AddressEntry {
                address,
                prefix_len,
                state,
            });
        }
    }

    pub fn has_ipv6(&self, address: Ipv6Addr) -> bool {
        self.ipv6.iter().any(|e| e.address == address)
    }

    pub fn is_tentative_v6(&self, address: Ipv6Addr) -> bool {
        self.ipv6
            .iter()
            .any(|e| e.address == address && e.is_tentative())
    }

    /// Source address for `dest`: link-local for link-local destinations,
    /// otherwise the first global address. Tentative addresses count; the
    /// engine checks their state separately.
    pub fn source_for_v6(&self, dest: Ipv6Addr) -> Option<Ipv6Addr> {
        let wants_link_local = dest.is_link_local() || dest.scope_id() == 2;
        let pick = |link_local: bool| {
            self.ipv6
                .iter()
                .find(|e| e.address.is_link_local() == link_local)
                .map(|e| e.address)
        };
        pick(wants_link_local).or_else(|| pick(!wants_link_local))
    }

    /// True if `dest` lies in one of this interface's IPv6 prefixes.
    pub fn on_link_v6(&self, dest: Ipv6Addr) -> bool {
        self.ipv6
            .iter()
            .any(|e| ipv6_prefix_matches(e.address, e.prefix_len, dest))
    }

    /// All-nodes, all-routers when forwarding, solicited-node groups of
    /// every address, and joined groups.
    pub fn is_member_v6(&self, group: Ipv6Addr, router: bool) -> bool {
        group == ALL_NODES
            || (router && group == ALL_ROUTERS)
            || self
                .ipv6
                .iter()
                .any(|e| solicited_node_for(e.address) == group)
            || self.ipv6_groups.contains(&group)
    }

    pub fn join_v6(&mut self, group: Ipv6Addr) {
        if !self.ipv6_groups.contains(&group) {
            self.ipv6_groups.push(group);
        }
    }

    pub fn leave_v6(&mut self, group: Ipv6Addr) {
        self.ipv6_groups.retain(|g| *g != group);
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InterfaceTable {
    interfaces: Vec<NetworkInterface>,
}

impl Default for InterfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceTable {
    /// A table holding only the loopback interface.
    pub fn new() -> Self {
        let mut lo = NetworkInterface::loopback();
        lo.id = LOOPBACK_ID;
        Self {
            interfaces: vec![lo],
        }
    }

    pub fn add(&mut self, mut interface: NetworkInterface) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len() as u32);
        interface.id = id;
        self.interfaces.push(interface);
        id
    }

    pub fn get(&self, id: InterfaceId) -> Option<&NetworkInterface> {
        self.interfaces.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: InterfaceId) -> Option<&mut NetworkInterface> {
        self.interfaces.get_mut(id.0 as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkInterface> {
        self.interfaces.iter()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    // ── IPv4 ─────────────────────────────────────────────────────────────────

    pub fn is_local_address_v4(&self, addr: Ipv4Addr) -> bool {
        self.interface_by_address_v4(addr).is_some()
    }

    pub fn interface_by_address_v4(&self, addr: Ipv4Addr) -> Option<&NetworkInterface> {
        self.interfaces
            .iter()
            .find(|i| i.ipv4_address() == Some(addr))
    }

    /// Limited broadcast, or the directed broadcast of an attached subnet.
    pub fn is_local_broadcast_v4(&self, addr: Ipv4Addr) -> bool {
        addr.is_broadcast() || self.interface_by_broadcast_v4(addr).is_some()
    }

    /// The broadcast-capable interface whose subnet broadcast is `addr`.
    pub fn interface_by_broadcast_v4(&self, addr: Ipv4Addr) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| {
            i.broadcast
                && i.ipv4
                    .as_ref()
                    .is_some_and(|d| d.prefix_len < 31 && d.broadcast() == addr)
        })
    }

    pub fn first_multicast_interface(&self) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.multicast && !i.loopback)
    }

    // ── IPv6 ─────────────────────────────────────────────────────────────────

    pub fn is_local_address_v6(&self, addr: Ipv6Addr) -> bool {
        self.interface_by_address_v6(addr).is_some()
    }

    pub fn interface_by_address_v6(&self, addr: Ipv6Addr) -> Option<&NetworkInterface> {
        self.interfaces.iter().find(|i| i.has_ipv6(addr))
    }

    pub fn is_tentative_v6(&self, addr: Ipv6Addr) -> bool {
        self.interfaces.iter().any(|i| i.is_tentative_v6(addr))
    }

    /// Promote tentative addresses whose detection period is over. Returns
    /// the addresses that became preferred.
    pub fn tick(&mut self, now: SimTime) -> Vec<(InterfaceId, Ipv6Addr)> {
        let mut promoted = Vec::new();
        for i in &mut self.interfaces {
            for e in &mut i.ipv6 {
                if let AddressState::Tentative { until } = e.state {
                    if now >= until {
                        e.state = AddressState::Preferred;
                        promoted.push((i.id, e.address));
                    }
                }
            }
        }
        for (interface, address) in &promoted {
            tracing::debug!(interface = %interface, address = %address, "address preferred");
        }
        promoted
    }
}

// ── Globs ─────────────────────────────────────────────────────────────────────

/// Match `text` against a space-separated list of patterns with `*` and `?`.
pub fn matches_glob_list(patterns: &str, text: &str) -> bool {
    patterns
        .split_whitespace()
        .any(|p| matches_glob(p.as_bytes(), text.as_bytes()))
}

fn matches_glob(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((b'*', rest)), _) => {
            matches_glob(rest, text) || (!text.is_empty() && matches_glob(pattern, &text[1..]))
        }
        (Some((b'?', rest)), Some((_, text_rest))) => matches_glob(rest, text_rest),
        (Some((p, rest)), Some((t, text_rest))) => p == t && matches_glob(rest, text_rest),
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn eth(name: &str, addr: &str, len: u8) -> NetworkInterface {
        let mut i = NetworkInterface::new(name, "0a:00:00:00:00:01".parse().unwrap());
        i.ipv4 = Some(Ipv4InterfaceData {
            address: addr.parse().unwrap(),
            prefix_len: len,
            multicast_groups: Vec::new(),
        });
        i
    }

    #[test]
    fn loopback_is_always_first() {
        let mut t = InterfaceTable::new();
        let id = t.add(eth("eth0", "10.0.0.1", 24));
        assert_eq!(id, InterfaceId(1));
        assert!(t.get(LOOPBACK_ID).unwrap().loopback);
        assert!(t.is_local_address_v4(Ipv4Addr::LOCALHOST));
        assert_eq!(t.by_name("eth0").unwrap().id, id);
    }

    #[test]
    fn broadcast_classification() {
        let mut t = InterfaceTable::new();
        t.add(eth("eth0", "10.0.0.1", 24));
        assert!(t.is_local_broadcast_v4(Ipv4Addr::BROADCAST));
        assert!(t.is_local_broadcast_v4(Ipv4Addr::new(10, 0, 0, 255)));
        assert!(!t.is_local_broadcast_v4(Ipv4Addr::new(10, 0, 1, 255)));
    }

    #[test]
    fn multicast_membership() {
        let mut i = eth("eth0", "10.0.0.1", 24);
        let group = Ipv4Addr::new(239, 1, 1, 1);
        assert!(!i.is_member_v4(group));
        i.join_v4(group);
        assert!(i.is_member_v4(group));
        assert!(i.is_member_v4(Ipv4Addr::new(224, 0, 0, 1)));
        i.leave_v4(group);
        assert!(!i.is_member_v4(group));
    }

    #[test]
    fn tentative_addresses_become_preferred() {
        let mut t = InterfaceTable::new();
        let mut i = eth("eth0", "10.0.0.1", 24);
        let addr: Ipv6Addr = "2001:db8::1".parse().unwrap();
        i.add_ipv6(addr, 64, AddressState::Tentative { until: Duration::from_secs(1) });
        let id = t.add(i);
        assert!(t.is_tentative_v6(addr));
        assert!(t.tick(Duration::from_millis(500)).is_empty());
        assert_eq!(t.tick(Duration::from_secs(1)), vec![(id, addr)]);
        assert!(!t.is_tentative_v6(addr));
    }

    #[test]
    fn ipv6_membership_and_source_selection() {
        let mut i = NetworkInterface::new("eth0", "0a:aa:00:00:00:01".parse().unwrap());
        let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let ll = link_local_for(i.mac);
        assert_eq!(ll, "fe80::8aa:ff:fe00:1".parse::<Ipv6Addr>().unwrap());
        i.add_ipv6(global, 64, AddressState::Preferred);
        i.add_ipv6(ll, 64, AddressState::Preferred);
        assert!(i.is_member_v6(solicited_node_for(global), false));
        assert!(i.is_member_v6(ALL_NODES, false));
        assert!(!i.is_member_v6(ALL_ROUTERS, false));
        assert!(i.is_member_v6(ALL_ROUTERS, true));
        assert_eq!(i.source_for_v6("2001:db8:1::2".parse().unwrap()), Some(global));
        assert_eq!(i.source_for_v6("ff02::1".parse().unwrap()), Some(ll));
        assert!(i.on_link_v6("2001:db8::99".parse().unwrap()));
        assert!(!i.on_link_v6("2001:db8:1::99".parse().unwrap()));
    }

    #[test]
    fn globs() {
        assert!(matches_glob_list("eth* ppp0", "eth1"));
        assert!(matches_glob_list("eth* ppp0", "ppp0"));
        assert!(matches_glob_list("router.eth?", "router.eth1"));
        assert!(!matches_glob_list("router.eth?", "router.eth10"));
        assert!(!matches_glob_list("", "eth0"));
        assert!(matches_glob_list("*", "anything"));
    }
}
