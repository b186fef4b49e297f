//! Internet checksum (RFC 1071), pseudo-headers and CRC modes.
//!
//! Every header that carries a checksum field also carries a `CrcMode`. Only
//! `Computed` ever touches real bytes; the declared modes are simulation
//! shortcuts whose sentinel values are visible on the wire.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentinel written by `CrcMode::DeclaredCorrect`.
pub const CRC_DECLARED_CORRECT: u16 = 0xC00D;
/// Sentinel written by `CrcMode::DeclaredIncorrect`.
pub const CRC_DECLARED_INCORRECT: u16 = 0xBAAD;
/// 32-bit sentinels for the Ethernet FCS.
pub const FCS_DECLARED_CORRECT: u32 = 0xC00D_C00D;
pub const FCS_DECLARED_INCORRECT: u32 = 0xBAAD_BAAD;

// ── Modes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcMode {
    /// Field forced to 0 and never checked.
    Disabled,
    /// Sentinel 0xC00D; receivers trust it (plus chunk correctness).
    #[default]
    DeclaredCorrect,
    /// Sentinel 0xBAAD; receivers reject it unless the bytes really check.
    DeclaredIncorrect,
    /// Real checksum over pseudo-header, header and payload.
    Computed,
}

impl CrcMode {
    /// Value written into a 16-bit checksum field before the real value is known.
    pub fn sentinel(self) -> u16 {
        match self {
            CrcMode::Disabled | CrcMode::Computed => 0,
            CrcMode::DeclaredCorrect => CRC_DECLARED_CORRECT,
            CrcMode::DeclaredIncorrect => CRC_DECLARED_INCORRECT,
        }
    }

    /// Mode of a checksum field read off the wire. The sentinels identify
    /// the declared modes; any other value is a real checksum.
    pub fn from_received(crc: u16) -> CrcMode {
        match crc {
            CRC_DECLARED_CORRECT => CrcMode::DeclaredCorrect,
            CRC_DECLARED_INCORRECT => CrcMode::DeclaredIncorrect,
            _ => CrcMode::Computed,
        }
    }
}

impl fmt::Display for CrcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrcMode::Disabled => "disabled",
            CrcMode::DeclaredCorrect => "declared_correct",
            CrcMode::DeclaredIncorrect => "declared_incorrect",
            CrcMode::Computed => "computed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown crc mode: {0:?}")]
pub struct ParseCrcModeError(String);

impl FromStr for CrcMode {
    type Err = ParseCrcModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(CrcMode::Disabled),
            "declared" | "declared_correct" => Ok(CrcMode::DeclaredCorrect),
            "declared_incorrect" => Ok(CrcMode::DeclaredIncorrect),
            "computed" => Ok(CrcMode::Computed),
            other => Err(ParseCrcModeError(other.to_string())),
        }
    }
}

// ── Internet checksum ─────────────────────────────────────────────────────────

/// Running one's-complement sum. Feed it slices in wire order; an odd byte
/// left over from one slice pairs with the first byte of the next.
#[derive(Debug, Clone, Default)]
pub struct ChecksumAccumulator {
    sum: u32,
    pending: Option<u8>,
}

impl ChecksumAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut bytes: &[u8]) {
        if let Some(high) = self.pending.take() {
            match bytes.split_first() {
                Some((&low, rest)) => {
                    self.add_word(u16::from_be_bytes([high, low]));
                    bytes = rest;
                }
                None => {
                    self.pending = Some(high);
                    return;
                }
            }
        }
        let mut words = bytes.chunks_exact(2);
        for w in &mut words {
            self.add_word(u16::from_be_bytes([w[0], w[1]]));
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
    }

    pub fn add_u16(&mut self, v: u16) {
        self.add(&v.to_be_bytes());
    }

    pub fn add_u32(&mut self, v: u32) {
        self.add(&v.to_be_bytes());
    }

    fn add_word(&mut self, w: u16) {
        self.sum += u32::from(w);
        self.sum = (self.sum & 0xffff) + (self.sum >> 16);
    }

    /// One's complement of the folded sum. A trailing odd byte is the high
    /// byte of a zero-padded word.
    pub fn finish(mut self) -> u16 {
        if let Some(high) = self.pending.take() {
            self.add_word(u16::from_be_bytes([high, 0]));
        }
        while self.sum > 0xffff {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
        !(self.sum as u16)
    }
}

/// RFC 1071 checksum of a byte slice.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut acc = ChecksumAccumulator::new();
    acc.add(bytes);
    acc.finish()
}

// ── Pseudo-headers ────────────────────────────────────────────────────────────

/// 12-byte IPv4 pseudo-header: src, dst, zero, protocol, length.
pub fn ipv4_pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> [u8; 12] {
    let mut out = [0u8; 12];
    out[0..4].copy_from_slice(&src.octets());
    out[4..8].copy_from_slice(&dst.octets());
    out[9] = protocol;
    out[10..12].copy_from_slice(&length.to_be_bytes());
    out
}

/// 40-byte IPv6 pseudo-header: src, dst, 32-bit length, 3 zero bytes, next header.
pub fn ipv6_pseudo_header(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, length: u32) -> [u8; 40] {
    let mut out = [0u8; 40];
    out[0..16].copy_from_slice(&src.octets());
    out[16..32].copy_from_slice(&dst.octets());
    out[32..36].copy_from_slice(&length.to_be_bytes());
    out[39] = next_header;
    out
}

/// Pseudo-header bytes for whichever family the addresses belong to.
/// Mixed families yield `None`.
pub fn pseudo_header(
    src: std::net::IpAddr,
    dst: std::net::IpAddr,
    protocol: u8,
    length: usize,
) -> Option<Vec<u8>> {
    use std::net::IpAddr;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let len = u16::try_from(length).ok()?;
            Some(ipv4_pseudo_header(s, d, protocol, len).to_vec())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let len = u32::try_from(length).ok()?;
            Some(ipv6_pseudo_header(s, d, protocol, len).to_vec())
        }
        _ => None,
    }
}

/// Transport checksum over pseudo-header plus segment (with its checksum
/// field zeroed). A result of 0 is transmitted as 0xFFFF.
pub fn transport_checksum(pseudo: &[u8], segment: &[u8]) -> u16 {
    let mut acc = ChecksumAccumulator::new();
    acc.add(pseudo);
    acc.add(segment);
    match acc.finish() {
        0 => 0xffff,
        v => v,
    }
}

/// True if `segment` (checksum field in place) sums to zero with `pseudo`.
pub fn verify_transport_checksum(pseudo: &[u8], segment: &[u8]) -> bool {
    let mut acc = ChecksumAccumulator::new();
    acc.add(pseudo);
    acc.add(segment);
    acc.finish() == 0
}
