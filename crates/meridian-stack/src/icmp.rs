//! ICMP (RFC 792) and ICMPv6 (RFC 4443): error generation from offending
//! datagrams, echo replies, and checksum verification of received messages.
//!
//! Error generation is best effort. A datagram that must not be answered
//! (another error, a later fragment, a broadcast or multicast destination)
//! or whose headers cannot be read is dropped silently.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use serde::Serialize;

use meridian_core::checksum::{internet_checksum, pseudo_header, verify_transport_checksum};
use meridian_core::chunk::Chunk;
use meridian_core::protocol;
use meridian_core::tags::{L3AddressInd, L3AddressReq, PacketProtocolTag};
use meridian_core::wire::icmp::{
    parameter_problem_v6, IcmpHeader, IcmpType, Icmpv6Header, Icmpv6Type, ICMP_HEADER_LENGTH,
};
use meridian_core::wire::ipv4::Ipv4Header;
use meridian_core::wire::ipv6::{Ipv6Header, IPV6_HEADER_LENGTH, IPV6_MIN_MTU};
use meridian_core::{CrcMode, FieldsChunk, Packet, PeekFlags};

use crate::interface::InterfaceTable;
use crate::stats::{DropCounters, DropReason};

/// Bytes of the offending datagram's payload quoted after its IPv4 header.
const IPV4_QUOTED_PAYLOAD: usize = 8;
const IP_PROTOCOL_ICMP: u8 = 1;
const IP_PROTOCOL_ICMPV6: u8 = 58;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IcmpStats {
    pub errors_sent: u64,
    pub errors_suppressed: u64,
    pub errors_received: u64,
    pub echo_requests_sent: u64,
    pub echo_requests_received: u64,
    pub echo_replies_sent: u64,
    pub echo_replies_received: u64,
    pub dropped: DropCounters,
}

#[derive(Debug)]
pub struct Icmp {
    v4_crc_mode: CrcMode,
    v6_crc_mode: CrcMode,
    pub stats: IcmpStats,
}

impl Icmp {
    pub fn new(v4_crc_mode: CrcMode, v6_crc_mode: CrcMode) -> Self {
        Self {
            v4_crc_mode,
            v6_crc_mode,
            stats: IcmpStats::default(),
        }
    }

    // ── IPv4 ─────────────────────────────────────────────────────────────────

    /// Build an error about `original`, whose data region starts at its IPv4
    /// header. The result is ready for the IPv4 engine's upper input.
    pub fn error_v4(
        &mut self,
        original: &Packet,
        icmp_type: IcmpType,
        code: u8,
        value: u32,
        interfaces: &InterfaceTable,
    ) -> Option<Packet> {
        let Ok(peeked) = original.peek_at_with::<Ipv4Header>(0, PeekFlags::ALLOW_INCORRECT) else {
            self.stats.errors_suppressed += 1;
            return None;
        };
        let header = peeked.header;
        if let Some(reason) = suppress_v4(original, &header, interfaces) {
            tracing::debug!(packet = original.name(), reason, "not sending icmp error");
            self.stats.errors_suppressed += 1;
            return None;
        }

        let quoted = original
            .data_length()
            .min(header.header_length() + IPV4_QUOTED_PAYLOAD);
        let Ok(body) = original.peek_data_at(0, quoted) else {
            self.stats.errors_suppressed += 1;
            return None;
        };

        let mut icmp = IcmpHeader::new(icmp_type, code);
        match icmp_type {
            IcmpType::DestinationUnreachable => {
                icmp.set_next_hop_mtu(u16::try_from(value).unwrap_or(u16::MAX))
            }
            IcmpType::ParameterProblem => icmp.set_pointer(u8::try_from(value).unwrap_or(0)),
            _ => {}
        }
        let name = format!("icmp-{}", original.name());
        let packet = self.finish_v4(&name, icmp, body, IpAddr::V4(header.src));
        tracing::debug!(
            packet = original.name(),
            icmp_type = ?icmp_type,
            code,
            dest = %header.src,
            "sending icmp error"
        );
        self.stats.errors_sent += 1;
        Some(packet)
    }

    fn finish_v4(&self, name: &str, mut icmp: IcmpHeader, body: Chunk, dest: IpAddr) -> Packet {
        icmp.crc_mode = self.v4_crc_mode;
        icmp.crc = match self.v4_crc_mode {
            CrcMode::Computed => {
                icmp.crc = 0;
                let mut bytes = icmp.to_bytes().to_vec();
                bytes.extend_from_slice(&body.to_bytes());
                internet_checksum(&bytes)
            }
            mode => mode.sentinel(),
        };
        let mut packet = Packet::with_chunk(name, body);
        // A fresh packet has no popped region.
        let _ = packet.insert_at_front(Chunk::fields(icmp));
        packet.set_tag(PacketProtocolTag(protocol::ICMPV4));
        packet.set_tag(L3AddressReq::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), dest));
        packet
    }

    /// Echo request to `dest` in the matching ICMP family.
    pub fn echo_request(
        &mut self,
        name: &str,
        dest: IpAddr,
        identifier: u16,
        sequence: u16,
        payload: Bytes,
    ) -> Packet {
        self.stats.echo_requests_sent += 1;
        let body = Chunk::bytes(payload);
        match dest {
            IpAddr::V4(_) => {
                let icmp = IcmpHeader::echo(IcmpType::EchoRequest, identifier, sequence);
                self.finish_v4(name, icmp, body, dest)
            }
            IpAddr::V6(d) => {
                let icmp = Icmpv6Header::echo(Icmpv6Type::EchoRequest, identifier, sequence);
                self.finish_v6(name, icmp, body, Ipv6Addr::UNSPECIFIED, d)
            }
        }
    }

    /// A received ICMP message, data region at the ICMP header. Returns an
    /// echo reply if one is due.
    pub fn process_v4(&mut self, packet: Packet) -> Option<Packet> {
        if !icmpv4_checksum_ok(&packet) {
            tracing::debug!(packet = packet.name(), "icmp checksum error");
            self.stats.dropped.record(DropReason::IncorrectlyReceived);
            return None;
        }
        let Ok(header) = packet.peek_at_front::<IcmpHeader>() else {
            self.stats.dropped.record(DropReason::Malformed);
            return None;
        };
        let addrs = packet.find_tag::<L3AddressInd>().copied();
        match header.icmp_type {
            IcmpType::EchoRequest => {
                self.stats.echo_requests_received += 1;
                let Some(L3AddressInd {
                    src: IpAddr::V4(src),
                    dest: IpAddr::V4(dest),
                }) = addrs
                else {
                    self.stats.dropped.record(DropReason::Malformed);
                    return None;
                };
                let Ok(body) = packet.peek_data_at(ICMP_HEADER_LENGTH, packet.data_length() - ICMP_HEADER_LENGTH)
                else {
                    self.stats.dropped.record(DropReason::Malformed);
                    return None;
                };
                let mut reply = header.clone();
                reply.icmp_type = IcmpType::EchoReply;
                let mut out = self.finish_v4(&format!("{}-reply", packet.name()), reply, body, IpAddr::V4(src));
                if !dest.is_multicast() && !dest.is_broadcast() {
                    out.set_tag(L3AddressReq::new(IpAddr::V4(dest), IpAddr::V4(src)));
                }
                self.stats.echo_replies_sent += 1;
                Some(out)
            }
            IcmpType::EchoReply => {
                self.stats.echo_replies_received += 1;
                None
            }
            other => {
                tracing::debug!(icmp_type = ?other, code = header.code, "icmp error received");
                self.stats.errors_received += 1;
                None
            }
        }
    }

    // ── IPv6 ─────────────────────────────────────────────────────────────────

    /// Build an ICMPv6 error about `original`, positioned at its IPv6
    /// header. Quotes as much of it as fits the minimum MTU.
    pub fn error_v6(
        &mut self,
        original: &Packet,
        icmp_type: Icmpv6Type,
        code: u8,
        value: u32,
    ) -> Option<Packet> {
        let Ok(header) = original.peek_at_front::<Ipv6Header>() else {
            self.stats.errors_suppressed += 1;
            return None;
        };
        if let Some(reason) = suppress_v6(original, &header, icmp_type, code) {
            tracing::debug!(packet = original.name(), reason, "not sending icmpv6 error");
            self.stats.errors_suppressed += 1;
            return None;
        }
        let quoted = original
            .data_length()
            .min(IPV6_MIN_MTU - IPV6_HEADER_LENGTH - ICMP_HEADER_LENGTH);
        let Ok(body) = original.peek_data_at(0, quoted) else {
            self.stats.errors_suppressed += 1;
            return None;
        };
        let mut icmp = Icmpv6Header::new(icmp_type, code);
        icmp.set_value(value);
        let packet = self.finish_v6(
            &format!("icmpv6-{}", original.name()),
            icmp,
            body,
            Ipv6Addr::UNSPECIFIED,
            header.src,
        );
        tracing::debug!(
            packet = original.name(),
            icmp_type = ?icmp_type,
            code,
            dest = %header.src,
            "sending icmpv6 error"
        );
        self.stats.errors_sent += 1;
        Some(packet)
    }

    /// Computed checksums need the final source address, so they are left
    /// to the checksum-insertion hook.
    fn finish_v6(
        &self,
        name: &str,
        mut icmp: Icmpv6Header,
        body: Chunk,
        src: Ipv6Addr,
        dest: Ipv6Addr,
    ) -> Packet {
        icmp.crc_mode = self.v6_crc_mode;
        icmp.crc = self.v6_crc_mode.sentinel();
        let mut packet = Packet::with_chunk(name, body);
        let _ = packet.insert_at_front(Chunk::fields(icmp));
        packet.set_tag(PacketProtocolTag(protocol::ICMPV6));
        packet.set_tag(L3AddressReq::new(IpAddr::V6(src), IpAddr::V6(dest)));
        packet
    }

    pub fn process_v6(&mut self, packet: Packet) -> Option<Packet> {
        if !icmpv6_checksum_ok(&packet) {
            tracing::debug!(packet = packet.name(), "icmpv6 checksum error");
            self.stats.dropped.record(DropReason::IncorrectlyReceived);
            return None;
        }
        let Ok(header) = packet.peek_at_front::<Icmpv6Header>() else {
            self.stats.dropped.record(DropReason::Malformed);
            return None;
        };
        match header.icmp_type {
            Icmpv6Type::EchoRequest => {
                self.stats.echo_requests_received += 1;
                let Some(L3AddressInd {
                    src: IpAddr::V6(src),
                    dest: IpAddr::V6(dest),
                }) = packet.find_tag::<L3AddressInd>().copied()
                else {
                    self.stats.dropped.record(DropReason::Malformed);
                    return None;
                };
                let Ok(body) = packet.peek_data_at(ICMP_HEADER_LENGTH, packet.data_length() - ICMP_HEADER_LENGTH)
                else {
                    self.stats.dropped.record(DropReason::Malformed);
                    return None;
                };
                let mut reply = header.clone();
                reply.icmp_type = Icmpv6Type::EchoReply;
                let reply_src = if dest.is_multicast() {
                    Ipv6Addr::UNSPECIFIED
                } else {
                    dest
                };
                self.stats.echo_replies_sent += 1;
                Some(self.finish_v6(
                    &format!("{}-reply", packet.name()),
                    reply,
                    body,
                    reply_src,
                    src,
                ))
            }
            Icmpv6Type::EchoReply => {
                self.stats.echo_replies_received += 1;
                None
            }
            other if other.is_error() => {
                tracing::debug!(icmp_type = ?other, code = header.code, "icmpv6 error received");
                self.stats.errors_received += 1;
                None
            }
            other => {
                tracing::trace!(icmp_type = ?other, "ignoring icmpv6 message");
                None
            }
        }
    }
}

fn suppress_v4(
    original: &Packet,
    header: &Ipv4Header,
    interfaces: &InterfaceTable,
) -> Option<&'static str> {
    if header.fragment_offset != 0 {
        return Some("not the first fragment");
    }
    if header.dest.is_multicast() || header.dest.is_broadcast() || interfaces.is_local_broadcast_v4(header.dest) {
        return Some("broadcast or multicast destination");
    }
    if header.src.is_unspecified() || header.src.is_multicast() || header.src.is_broadcast() {
        return Some("no usable source address");
    }
    if header.protocol == IP_PROTOCOL_ICMP {
        match original.peek_at_with::<IcmpHeader>(header.header_length(), PeekFlags::ALLOW_INCORRECT) {
            Ok(p) if p.header.icmp_type.is_error() => return Some("original is an icmp error"),
            Ok(_) => {}
            Err(_) => return Some("original icmp header unreadable"),
        }
    }
    None
}

fn suppress_v6(
    original: &Packet,
    header: &Ipv6Header,
    icmp_type: Icmpv6Type,
    code: u8,
) -> Option<&'static str> {
    // RFC 4443 §2.4(e): too-big and unrecognized-option problems are
    // reported even for multicast destinations.
    let multicast_exempt = icmp_type == Icmpv6Type::PacketTooBig
        || (icmp_type == Icmpv6Type::ParameterProblem
            && code == parameter_problem_v6::UNRECOGNIZED_OPTION);
    if header.dest.is_multicast() && !multicast_exempt {
        return Some("multicast destination");
    }
    if header.src.is_unspecified() || header.src.is_multicast() {
        return Some("no usable source address");
    }
    if let Some((offset, _, _)) = header.fragment_header() {
        if offset != 0 {
            return Some("not the first fragment");
        }
    }
    if header.protocol == IP_PROTOCOL_ICMPV6 {
        match original.peek_at_with::<Icmpv6Header>(header.header_length(), PeekFlags::ALLOW_INCORRECT) {
            Ok(p) if p.header.icmp_type.is_error() => return Some("original is an icmpv6 error"),
            Ok(_) => {}
            Err(_) => return Some("original icmpv6 header unreadable"),
        }
    }
    None
}

/// Verify a received ICMP message positioned at its header.
pub fn icmpv4_checksum_ok(packet: &Packet) -> bool {
    let Ok(peeked) = packet.peek_at_with::<IcmpHeader>(0, PeekFlags::ALLOW_INCORRECT) else {
        return false;
    };
    match peeked.header.crc_mode {
        CrcMode::Disabled => true,
        CrcMode::DeclaredCorrect => packet.is_data_correct(),
        CrcMode::DeclaredIncorrect | CrcMode::Computed => {
            packet.is_data_correct() && internet_checksum(&packet.data_bytes()) == 0
        }
    }
}

/// Verify a received ICMPv6 message positioned at its header. Computed
/// checksums need `L3AddressInd` for the pseudo-header.
pub fn icmpv6_checksum_ok(packet: &Packet) -> bool {
    let Ok(peeked) = packet.peek_at_with::<Icmpv6Header>(0, PeekFlags::ALLOW_INCORRECT) else {
        return false;
    };
    match peeked.header.crc_mode {
        CrcMode::Disabled => true,
        CrcMode::DeclaredCorrect => packet.is_data_correct(),
        CrcMode::DeclaredIncorrect | CrcMode::Computed => {
            let Some(addrs) = packet.find_tag::<L3AddressInd>() else {
                return false;
            };
            let Some(pseudo) = pseudo_header(addrs.src, addrs.dest, IP_PROTOCOL_ICMPV6, packet.data_length())
            else {
                return false;
            };
            packet.is_data_correct() && verify_transport_checksum(&pseudo, &packet.data_bytes())
        }
    }
}
