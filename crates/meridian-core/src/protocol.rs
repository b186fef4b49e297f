//! Protocol registry: stable identities for every protocol the stack knows,
//! plus groups mapping on-wire numbers (IP protocol, EtherType) to them.

use std::fmt;

/// OSI-ish layer a protocol lives at. Used for logging and sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    Link,
    Network,
    Transport,
}

/// A protocol identity. Compared by `id`; the names are for humans.
#[derive(Clone, Copy)]
pub struct Protocol {
    pub id: i32,
    pub name: &'static str,
    pub descriptive_name: &'static str,
    pub layer: Layer,
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Protocol {}

impl std::hash::Hash for Protocol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Protocol({}#{})", self.name, self.id)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

const fn proto(id: i32, name: &'static str, descriptive_name: &'static str, layer: Layer) -> Protocol {
    Protocol {
        id,
        name,
        descriptive_name,
        layer,
    }
}

pub const ETHERNET_MAC: Protocol = proto(1, "ethernetmac", "Ethernet MAC", Layer::Link);
pub const ARP: Protocol = proto(2, "arp", "ARP", Layer::Network);
pub const IPV4: Protocol = proto(3, "ipv4", "IPv4", Layer::Network);
pub const IPV6: Protocol = proto(4, "ipv6", "IPv6", Layer::Network);
pub const ICMPV4: Protocol = proto(5, "icmpv4", "ICMPv4", Layer::Network);
pub const ICMPV6: Protocol = proto(6, "icmpv6", "ICMPv6", Layer::Network);
pub const IGMP: Protocol = proto(7, "igmp", "IGMP", Layer::Network);
pub const TCP: Protocol = proto(8, "tcp", "TCP", Layer::Transport);
pub const UDP: Protocol = proto(9, "udp", "UDP", Layer::Transport);
pub const PIM: Protocol = proto(10, "pim", "PIM", Layer::Network);
pub const MOBILE_IPV6: Protocol = proto(11, "mobileipv6", "Mobile IPv6", Layer::Network);

/// Every registered protocol, ordered by id.
pub const ALL: [Protocol; 11] = [
    ETHERNET_MAC,
    ARP,
    IPV4,
    IPV6,
    ICMPV4,
    ICMPV6,
    IGMP,
    TCP,
    UDP,
    PIM,
    MOBILE_IPV6,
];

impl Protocol {
    pub fn from_id(id: i32) -> Option<Protocol> {
        ALL.iter().copied().find(|p| p.id == id)
    }

    pub fn from_name(name: &str) -> Option<Protocol> {
        ALL.iter().copied().find(|p| p.name == name)
    }
}

// ── Protocol groups ───────────────────────────────────────────────────────────

/// Maps wire numbers in one numbering space to protocols.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolGroup {
    pub name: &'static str,
    entries: &'static [(u16, Protocol)],
}

impl ProtocolGroup {
    pub fn find_protocol(&self, number: u16) -> Option<Protocol> {
        self.entries
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, p)| *p)
    }

    pub fn find_number(&self, protocol: Protocol) -> Option<u16> {
        self.entries
            .iter()
            .find(|(_, p)| *p == protocol)
            .map(|(n, _)| *n)
    }
}

/// IANA IP protocol numbers (IPv4 protocol field, IPv6 next header).
pub const IP_PROTOCOLS: ProtocolGroup = ProtocolGroup {
    name: "ipprotocol",
    entries: &[
        (1, ICMPV4),
        (2, IGMP),
        (4, IPV4),
        (6, TCP),
        (17, UDP),
        (41, IPV6),
        (58, ICMPV6),
        (103, PIM),
        (135, MOBILE_IPV6),
    ],
};

/// IEEE EtherTypes.
pub const ETHERTYPES: ProtocolGroup = ProtocolGroup {
    name: "ethertype",
    entries: &[(0x0800, IPV4), (0x0806, ARP), (0x86dd, IPV6)],
};

/// IP protocol number of `protocol`, as carried in the IPv4/IPv6 header.
pub fn ip_protocol_number(protocol: Protocol) -> Option<u8> {
    IP_PROTOCOLS
        .find_number(protocol)
        .and_then(|n| u8::try_from(n).ok())
}
