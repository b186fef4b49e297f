//! Configuration system for Meridian.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERIDIAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meridian/config.toml
//!   3. ~/.config/meridian/config.toml

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::address::MacAddress;
use crate::checksum::CrcMode;

/// Smallest MTU that carries a full IPv4 header plus eight bytes.
pub const MIN_IPV4_MTU: usize = 68;
/// Minimum link MTU for interfaces with IPv6 addresses (RFC 8200 section 5).
pub const MIN_IPV6_MTU: usize = 1280;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub simulation: SimulationConfig,
    pub ipv4: Ipv4Config,
    pub ipv6: Ipv6Config,
    pub udp: UdpConfig,
    pub red: RedConfig,
    pub nodes: Vec<NodeConfig>,
    pub links: Vec<LinkConfig>,
    pub traffic: Vec<TrafficConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated seconds to run. 0 = until interrupted.
    pub duration_secs: u64,
    /// Timer granularity for retries, purges and cache expiry.
    pub tick_millis: u64,
    /// Seed for bit-error draws and RED.
    pub seed: u64,
    /// Ethernet FCS mode on every link.
    pub link_crc_mode: CrcMode,
    /// Where to write the JSON statistics report. Empty = stdout.
    pub report_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv4Config {
    pub crc_mode: CrcMode,
    pub default_ttl: u8,
    pub default_multicast_ttl: u8,
    /// Reassembly buffers older than this are purged.
    pub fragment_timeout_secs: u64,
    /// Send limited broadcasts without an explicit interface on every interface.
    pub limited_broadcast: bool,
    /// Interface-name glob on which directed broadcasts are re-broadcast.
    /// Empty = never.
    pub direct_broadcast_interfaces: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6Config {
    /// ICMPv6 and Neighbour Discovery checksums.
    pub crc_mode: CrcMode,
    pub default_hop_limit: u8,
    pub fragment_timeout_secs: u64,
    /// Seconds a destination-cache entry lives when its route has no expiry.
    pub destination_cache_lifetime_secs: u64,
    /// Retries while the source address is tentative before giving up.
    pub tentative_retry_limit: u32,
    /// Time a configured address stays tentative before it is preferred.
    pub dad_delay_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub crc_mode: CrcMode,
    /// Inclusive start of the ephemeral port range.
    pub ephemeral_port_start: u16,
    /// Exclusive end of the ephemeral port range.
    pub ephemeral_port_end: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedConfig {
    /// Put a RED queue in front of every interface.
    pub enabled: bool,
    /// Hard queue limit in packets.
    pub capacity: usize,
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub max_probability: f64,
    /// EWMA weight.
    pub weight: f64,
    /// Packets per second, used to age the average across idle periods.
    pub packet_rate: f64,
    /// Mark ECN-capable packets instead of dropping them.
    pub use_ecn: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Forward unicast datagrams not addressed to this node.
    pub forwarding: bool,
    pub multicast_forwarding: bool,
    pub interfaces: Vec<InterfaceConfig>,
    pub routes: Vec<RouteConfig>,
    pub ipv6_routes: Vec<Ipv6RouteConfig>,
    pub multicast_routes: Vec<MulticastRouteConfig>,
    /// IPv6 default routers for Neighbour Discovery. Hosts use these when
    /// the routing table has no match.
    pub default_routers: Vec<DefaultRouterConfig>,
    /// Overrides `ipv6.dad_delay_millis` for this node.
    pub dad_delay_millis: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    pub mac: MacAddress,
    /// "a.b.c.d/len". Empty = no IPv4 address.
    pub ipv4: String,
    /// "addr/len" entries.
    pub ipv6: Vec<String>,
    /// 0 = unbounded.
    pub mtu: usize,
    pub broadcast: bool,
    pub multicast: bool,
    pub point_to_point: bool,
    /// IPv4 and IPv6 groups joined at start.
    pub multicast_groups: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// "a.b.c.d/len".
    pub destination: String,
    pub gateway: Ipv4Addr,
    pub interface: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipv6RouteConfig {
    /// "prefix/len".
    pub destination: String,
    pub next_hop: Ipv6Addr,
    pub interface: String,
    pub metric: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultRouterConfig {
    pub address: Ipv6Addr,
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastRouteConfig {
    /// Source prefix "a.b.c.d/len"; "0.0.0.0/0" = any source.
    pub origin: String,
    pub group: Ipv4Addr,
    /// Reverse-path interface. Empty = accept from any interface.
    pub input_interface: String,
    pub output_interfaces: Vec<MulticastOutputConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastOutputConfig {
    pub interface: String,
    /// Leaf interfaces only forward when a listener is present.
    pub leaf: bool,
    /// Packets with TTL at or below this are not forwarded here.
    pub ttl_threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// "node.interface".
    pub a: String,
    pub b: String,
    pub delay_millis: u64,
    /// Bits per second. 0 = unbounded.
    pub datarate_bps: u64,
    /// Per-bit error probability.
    pub bit_error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Sending node.
    pub from: String,
    /// Destination address (either family).
    pub to: String,
    pub dest_port: u16,
    pub payload_bytes: usize,
    pub interval_millis: u64,
    /// Datagrams to send. 0 = unlimited.
    pub count: u64,
    /// ECN codepoint requested for every datagram.
    pub ecn: u8,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MeridianConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            ipv4: Ipv4Config::default(),
            ipv6: Ipv6Config::default(),
            udp: UdpConfig::default(),
            red: RedConfig::default(),
            nodes: default_nodes(),
            links: default_links(),
            traffic: default_traffic(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10,
            tick_millis: 100,
            seed: 1,
            link_crc_mode: CrcMode::Computed,
            report_path: String::new(),
        }
    }
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            // Links carry serialized bytes, so real checksums are the default.
            crc_mode: CrcMode::Computed,
            default_ttl: 32,
            default_multicast_ttl: 1,
            fragment_timeout_secs: 60,
            limited_broadcast: false,
            direct_broadcast_interfaces: String::new(),
        }
    }
}

impl Default for Ipv6Config {
    fn default() -> Self {
        Self {
            crc_mode: CrcMode::Computed,
            default_hop_limit: 32,
            fragment_timeout_secs: 60,
            destination_cache_lifetime_secs: 600,
            tentative_retry_limit: 10,
            dad_delay_millis: 1500,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            crc_mode: CrcMode::Computed,
            ephemeral_port_start: 1024,
            ephemeral_port_end: 5000,
        }
    }
}

impl Default for RedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            min_threshold: 5.0,
            max_threshold: 50.0,
            max_probability: 0.02,
            weight: 0.002,
            packet_rate: 150.0,
            use_ecn: true,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            forwarding: false,
            multicast_forwarding: false,
            interfaces: Vec::new(),
            routes: Vec::new(),
            ipv6_routes: Vec::new(),
            multicast_routes: Vec::new(),
            default_routers: Vec::new(),
            dad_delay_millis: None,
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            mac: MacAddress::UNSPECIFIED,
            ipv4: String::new(),
            ipv6: Vec::new(),
            mtu: 1500,
            broadcast: true,
            multicast: true,
            point_to_point: false,
            multicast_groups: Vec::new(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            destination: "0.0.0.0/0".to_string(),
            gateway: Ipv4Addr::UNSPECIFIED,
            interface: String::new(),
            metric: 0,
        }
    }
}

impl Default for Ipv6RouteConfig {
    fn default() -> Self {
        Self {
            destination: "::/0".to_string(),
            next_hop: Ipv6Addr::UNSPECIFIED,
            interface: String::new(),
            metric: 0,
        }
    }
}

impl Default for DefaultRouterConfig {
    fn default() -> Self {
        Self {
            address: Ipv6Addr::UNSPECIFIED,
            interface: String::new(),
        }
    }
}

impl Default for MulticastRouteConfig {
    fn default() -> Self {
        Self {
            origin: "0.0.0.0/0".to_string(),
            group: Ipv4Addr::UNSPECIFIED,
            input_interface: String::new(),
            output_interfaces: Vec::new(),
        }
    }
}

impl Default for MulticastOutputConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            leaf: false,
            ttl_threshold: 0,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            a: String::new(),
            b: String::new(),
            delay_millis: 1,
            datarate_bps: 0,
            bit_error_rate: 0.0,
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            from: String::new(),
            to: String::new(),
            dest_port: 5000,
            payload_bytes: 100,
            interval_millis: 1000,
            count: 0,
            ecn: 0,
        }
    }
}

fn iface(name: &str, mac: [u8; 6], ipv4: &str, ipv6: &str) -> InterfaceConfig {
    InterfaceConfig {
        name: name.to_string(),
        mac: MacAddress(mac),
        ipv4: ipv4.to_string(),
        ipv6: vec![ipv6.to_string()],
        ..InterfaceConfig::default()
    }
}

fn default_route(gateway: Ipv4Addr, router: &str) -> (RouteConfig, DefaultRouterConfig) {
    (
        RouteConfig {
            gateway,
            interface: "eth0".to_string(),
            ..RouteConfig::default()
        },
        DefaultRouterConfig {
            address: router.parse().unwrap_or(Ipv6Addr::UNSPECIFIED),
            interface: "eth0".to_string(),
        },
    )
}

/// Two hosts on separate subnets joined by one router.
fn default_nodes() -> Vec<NodeConfig> {
    let (a4, a6) = default_route(Ipv4Addr::new(10, 0, 0, 254), "2001:db8::fe");
    let (b4, b6) = default_route(Ipv4Addr::new(10, 0, 1, 254), "2001:db8:1::fe");
    vec![
        NodeConfig {
            name: "host-a".to_string(),
            interfaces: vec![iface("eth0", [0x0a, 0xaa, 0, 0, 0, 1], "10.0.0.1/24", "2001:db8::1/64")],
            routes: vec![a4],
            default_routers: vec![a6],
            ..NodeConfig::default()
        },
        NodeConfig {
            name: "router".to_string(),
            forwarding: true,
            interfaces: vec![
                iface("eth0", [0x0a, 0xaa, 0, 0, 1, 1], "10.0.0.254/24", "2001:db8::fe/64"),
                iface("eth1", [0x0a, 0xaa, 0, 0, 1, 2], "10.0.1.254/24", "2001:db8:1::fe/64"),
            ],
            ..NodeConfig::default()
        },
        NodeConfig {
            name: "host-b".to_string(),
            interfaces: vec![iface("eth0", [0x0a, 0xaa, 0, 0, 2, 1], "10.0.1.2/24", "2001:db8:1::2/64")],
            routes: vec![b4],
            default_routers: vec![b6],
            ..NodeConfig::default()
        },
    ]
}

fn default_links() -> Vec<LinkConfig> {
    vec![
        LinkConfig {
            a: "host-a.eth0".to_string(),
            b: "router.eth0".to_string(),
            ..LinkConfig::default()
        },
        LinkConfig {
            a: "router.eth1".to_string(),
            b: "host-b.eth0".to_string(),
            ..LinkConfig::default()
        },
    ]
}

fn default_traffic() -> Vec<TrafficConfig> {
    vec![
        TrafficConfig {
            from: "host-a".to_string(),
            to: "10.0.1.2".to_string(),
            ..TrafficConfig::default()
        },
        TrafficConfig {
            from: "host-a".to_string(),
            to: "2001:db8:1::2".to_string(),
            dest_port: 5001,
            ..TrafficConfig::default()
        },
    ]
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meridian")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Address parsing ───────────────────────────────────────────────────────────

/// Parse "a.b.c.d/len".
pub fn parse_ipv4_cidr(s: &str) -> Result<(Ipv4Addr, u8), ConfigError> {
    let (addr, len) = split_cidr(s)?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad IPv4 address in {s:?}")))?;
    if len > 32 {
        return Err(ConfigError::Invalid(format!("prefix too long in {s:?}")));
    }
    Ok((addr, len))
}

/// Parse "prefix/len".
pub fn parse_ipv6_cidr(s: &str) -> Result<(Ipv6Addr, u8), ConfigError> {
    let (addr, len) = split_cidr(s)?;
    let addr: Ipv6Addr = addr
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad IPv6 address in {s:?}")))?;
    if len > 128 {
        return Err(ConfigError::Invalid(format!("prefix too long in {s:?}")));
    }
    Ok((addr, len))
}

fn split_cidr(s: &str) -> Result<(&str, u8), ConfigError> {
    let (addr, len) = s
        .split_once('/')
        .ok_or_else(|| ConfigError::Invalid(format!("missing prefix length in {s:?}")))?;
    let len = len
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("bad prefix length in {s:?}")))?;
    Ok((addr, len))
}

/// Split "node.interface".
pub fn parse_endpoint(s: &str) -> Result<(&str, &str), ConfigError> {
    s.rsplit_once('.')
        .ok_or_else(|| ConfigError::Invalid(format!("link endpoint {s:?} is not node.interface")))
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeridianConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeridianConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeridianConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MERIDIAN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MERIDIAN_SIMULATION__DURATION_SECS") {
            if let Ok(n) = v.parse() {
                self.simulation.duration_secs = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_SIMULATION__SEED") {
            if let Ok(n) = v.parse() {
                self.simulation.seed = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_SIMULATION__LINK_CRC_MODE") {
            if let Ok(m) = v.parse() {
                self.simulation.link_crc_mode = m;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_SIMULATION__REPORT_PATH") {
            self.simulation.report_path = v;
        }
        if let Ok(v) = std::env::var("MERIDIAN_IPV4__CRC_MODE") {
            if let Ok(m) = v.parse() {
                self.ipv4.crc_mode = m;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_IPV4__DEFAULT_TTL") {
            if let Ok(n) = v.parse() {
                self.ipv4.default_ttl = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_IPV4__LIMITED_BROADCAST") {
            self.ipv4.limited_broadcast = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MERIDIAN_IPV6__DEFAULT_HOP_LIMIT") {
            if let Ok(n) = v.parse() {
                self.ipv6.default_hop_limit = n;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_UDP__CRC_MODE") {
            if let Ok(m) = v.parse() {
                self.udp.crc_mode = m;
            }
        }
        if let Ok(v) = std::env::var("MERIDIAN_RED__ENABLED") {
            self.red.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MERIDIAN_RED__USE_ECN") {
            self.red.use_ecn = v == "true" || v == "1";
        }
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let red = &self.red;
        if red.min_threshold < 0.0 || red.min_threshold >= red.max_threshold {
            return Err(ConfigError::Invalid(
                "red.min_threshold must be below red.max_threshold".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&red.max_probability) || !(0.0..=1.0).contains(&red.weight) {
            return Err(ConfigError::Invalid(
                "red probabilities must lie in [0, 1]".to_string(),
            ));
        }
        if self.udp.ephemeral_port_start >= self.udp.ephemeral_port_end {
            return Err(ConfigError::Invalid("empty ephemeral port range".to_string()));
        }
        for node in &self.nodes {
            for i in &node.interfaces {
                if !i.ipv4.is_empty() {
                    parse_ipv4_cidr(&i.ipv4)?;
                }
                for a in &i.ipv6 {
                    parse_ipv6_cidr(a)?;
                }
                let floor = if i.ipv6.is_empty() { MIN_IPV4_MTU } else { MIN_IPV6_MTU };
                if i.mtu != 0 && i.mtu < floor {
                    return Err(ConfigError::Invalid(format!(
                        "{}.{}: mtu {} is below the minimum of {floor}",
                        node.name, i.name, i.mtu
                    )));
                }
            }
            for r in &node.routes {
                parse_ipv4_cidr(&r.destination)?;
                self.require_interface(node, &r.interface)?;
            }
            for r in &node.ipv6_routes {
                parse_ipv6_cidr(&r.destination)?;
                self.require_interface(node, &r.interface)?;
            }
            for r in &node.default_routers {
                self.require_interface(node, &r.interface)?;
            }
        }
        for link in &self.links {
            for end in [&link.a, &link.b] {
                let (node, ifname) = parse_endpoint(end)?;
                let node = self.node(node).ok_or_else(|| {
                    ConfigError::Invalid(format!("link endpoint {end:?} names an unknown node"))
                })?;
                self.require_interface(node, ifname)?;
            }
        }
        for t in &self.traffic {
            if self.node(&t.from).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "traffic source {:?} is not a node",
                    t.from
                )));
            }
            if t.to.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "traffic destination {:?} is not an address",
                    t.to
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn require_interface(&self, node: &NodeConfig, ifname: &str) -> Result<(), ConfigError> {
        if node.interfaces.iter().any(|i| i.name == ifname) {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "node {:?} has no interface {ifname:?}",
                node.name
            )))
        }
    }
}
