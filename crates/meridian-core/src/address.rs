//! Link-layer addresses, identifiers, and address-class helpers for IP.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────────────────

/// Identifies a network interface within one node's interface table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// Identifies an application socket within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock{}", self.0)
    }
}

// ── MAC address ───────────────────────────────────────────────────────────────

/// 48-bit IEEE 802 MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const UNSPECIFIED: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (includes broadcast).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// RFC 1112 mapping: 01:00:5e followed by the low 23 bits of the group.
    pub fn multicast_for_ipv4(group: Ipv4Addr) -> Self {
        let o = group.octets();
        MacAddress([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    /// RFC 2464 mapping: 33:33 followed by the low 32 bits of the group.
    pub fn multicast_for_ipv6(group: Ipv6Addr) -> Self {
        let o = group.octets();
        MacAddress([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct ParseMacError(String);

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddress(out))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

// ── IP address classes ────────────────────────────────────────────────────────

/// Address-class predicates the forwarding engines need beyond `std`.
pub trait Ipv4AddrExt {
    /// 224.0.0.0/24, never forwarded.
    fn is_link_local_multicast(&self) -> bool;
    /// Subnet-directed broadcast address for this address and netmask.
    fn broadcast_for(&self, netmask: Ipv4Addr) -> Ipv4Addr;
    /// True if `other` is in the same subnet under `netmask`.
    fn same_subnet(&self, other: Ipv4Addr, netmask: Ipv4Addr) -> bool;
}

impl Ipv4AddrExt for Ipv4Addr {
    fn is_link_local_multicast(&self) -> bool {
        let o = self.octets();
        o[0] == 224 && o[1] == 0 && o[2] == 0
    }

    fn broadcast_for(&self, netmask: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(*self) | !u32::from(netmask))
    }

    fn same_subnet(&self, other: Ipv4Addr, netmask: Ipv4Addr) -> bool {
        let mask = u32::from(netmask);
        u32::from(*self) & mask == u32::from(other) & mask
    }
}

pub trait Ipv6AddrExt {
    /// Scope nibble of a multicast address (RFC 4291 §2.7). 0 for unicast.
    fn scope_id(&self) -> u8;
    /// fe80::/10.
    fn is_link_local(&self) -> bool;
    /// ff02::1:ff00:0/104.
    fn is_solicited_node_multicast(&self) -> bool;
}

impl Ipv6AddrExt for Ipv6Addr {
    fn scope_id(&self) -> u8 {
        if self.is_multicast() {
            self.octets()[1] & 0x0f
        } else {
            0
        }
    }

    fn is_link_local(&self) -> bool {
        let s = self.segments();
        s[0] & 0xffc0 == 0xfe80
    }

    fn is_solicited_node_multicast(&self) -> bool {
        let s = self.segments();
        s[0] == 0xff02 && s[1..5] == [0, 0, 0, 0] && s[5] == 1 && s[6] & 0xff00 == 0xff00
    }
}

/// Convert a prefix length to a dotted netmask.
pub fn netmask_from_prefix(prefix_len: u8) -> Ipv4Addr {
    let len = u32::from(prefix_len.min(32));
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ipv4Addr::from(mask)
}

/// True if `addr` falls inside `network/prefix_len`.
pub fn ipv6_prefix_matches(network: Ipv6Addr, prefix_len: u8, addr: Ipv6Addr) -> bool {
    let len = u32::from(prefix_len.min(128));
    if len == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - len);
    u128::from(network) & mask == u128::from(addr) & mask
}
