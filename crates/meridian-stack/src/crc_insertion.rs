//! POSTROUTING hook that fills transport checksums in computed mode.
//!
//! Transports leave the checksum field at 0 when their mode is `Computed`
//! because the source address is not final until the L3 engine has picked
//! the egress interface. This hook runs after that decision, takes the IP
//! and transport headers off the front, writes the real checksum and puts
//! both back. Forwarded packets are left alone.

use std::net::IpAddr;

use meridian_core::checksum::{internet_checksum, pseudo_header, transport_checksum};
use meridian_core::protocol::{self, IP_PROTOCOLS};
use meridian_core::tags::{InterfaceInd, PacketProtocolTag};
use meridian_core::wire::{Icmpv6Header, Ipv4Header, Ipv6Header, PimHeader, TcpHeader, UdpHeader};
use meridian_core::{Chunk, CrcMode, FieldsChunk, Header, Packet, PacketError};

use crate::netfilter::{NetfilterHook, Verdict};

/// Priority the node registers the hook at. Filters that should see the
/// packet before its checksum is final register below this.
pub const CRC_INSERTION_PRIORITY: i32 = 10;

// ── Checksummed transport headers ─────────────────────────────────────────────

trait ChecksummedHeader: Header {
    fn crc_mode(&self) -> CrcMode;

    fn set_crc(&mut self, crc: u16);

    /// Whether the checksum covers an IP pseudo-header on this family.
    fn uses_pseudo_header(_ipv6: bool) -> bool {
        true
    }
}

impl ChecksummedHeader for UdpHeader {
    fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    fn set_crc(&mut self, crc: u16) {
        self.crc = crc;
    }
}

impl ChecksummedHeader for TcpHeader {
    fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    fn set_crc(&mut self, crc: u16) {
        self.crc = crc;
    }
}

impl ChecksummedHeader for Icmpv6Header {
    fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    fn set_crc(&mut self, crc: u16) {
        self.crc = crc;
    }
}

impl ChecksummedHeader for PimHeader {
    fn crc_mode(&self) -> CrcMode {
        self.crc_mode
    }

    fn set_crc(&mut self, crc: u16) {
        self.crc = crc;
    }

    // PIM over IPv4 sums the message alone (RFC 7761 §4.9).
    fn uses_pseudo_header(ipv6: bool) -> bool {
        ipv6
    }
}

// ── Hook ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CrcInsertionHook {
    inserted: u64,
}

impl CrcInsertionHook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksums written so far.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }
}

impl NetfilterHook for CrcInsertionHook {
    fn name(&self) -> &str {
        "crc-insertion"
    }

    fn post_routing(&mut self, packet: &mut Packet) -> Verdict {
        if packet.find_tag::<InterfaceInd>().is_some() {
            return Verdict::Accept;
        }
        match insert_crc(packet) {
            Ok(true) => {
                self.inserted += 1;
                tracing::trace!(packet = packet.name(), "transport checksum inserted");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(packet = packet.name(), error = %e, "checksum insertion failed");
            }
        }
        Verdict::Accept
    }
}

/// Fill the transport checksum of a packet positioned at its IP header.
/// Returns whether a checksum was written.
pub fn insert_crc(packet: &mut Packet) -> Result<bool, PacketError> {
    let Some(PacketProtocolTag(network)) = packet.find_tag::<PacketProtocolTag>().copied() else {
        return Ok(false);
    };
    if packet.front_offset() != 0 {
        return Ok(false);
    }
    if network == protocol::IPV4 {
        let ip = packet.remove_at_front::<Ipv4Header>()?;
        let result = if ip.is_fragment() {
            Ok(false)
        } else {
            fill_transport(packet, ip.src.into(), ip.dest.into(), ip.protocol)
        };
        packet.insert_at_front(Chunk::fields(ip))?;
        result
    } else if network == protocol::IPV6 {
        let ip = packet.remove_at_front::<Ipv6Header>()?;
        let result = if ip.fragment_header().is_some() {
            Ok(false)
        } else {
            fill_transport(packet, ip.src.into(), ip.dest.into(), ip.protocol)
        };
        packet.insert_at_front(Chunk::fields(ip))?;
        result
    } else {
        Ok(false)
    }
}

fn fill_transport(
    packet: &mut Packet,
    src: IpAddr,
    dest: IpAddr,
    number: u8,
) -> Result<bool, PacketError> {
    let Some(transport) = IP_PROTOCOLS.find_protocol(u16::from(number)) else {
        return Ok(false);
    };
    if transport == protocol::UDP {
        fill::<UdpHeader>(packet, src, dest, number)
    } else if transport == protocol::TCP {
        fill::<TcpHeader>(packet, src, dest, number)
    } else if transport == protocol::ICMPV6 {
        fill::<Icmpv6Header>(packet, src, dest, number)
    } else if transport == protocol::PIM {
        fill::<PimHeader>(packet, src, dest, number)
    } else {
        Ok(false)
    }
}

fn fill<T: ChecksummedHeader>(
    packet: &mut Packet,
    src: IpAddr,
    dest: IpAddr,
    number: u8,
) -> Result<bool, PacketError> {
    let mut header = packet.remove_at_front::<T>()?;
    if header.crc_mode() != CrcMode::Computed {
        packet.insert_at_front(Chunk::fields(header))?;
        return Ok(false);
    }
    header.set_crc(0);
    let mut segment = header.to_bytes().to_vec();
    segment.extend_from_slice(&packet.data_bytes());
    let crc = if T::uses_pseudo_header(dest.is_ipv6()) {
        match pseudo_header(src, dest, number, segment.len()) {
            Some(pseudo) => transport_checksum(&pseudo, &segment),
            None => {
                packet.insert_at_front(Chunk::fields(header))?;
                return Ok(false);
            }
        }
    } else {
        internet_checksum(&segment)
    };
    header.set_crc(crc);
    packet.insert_at_front(Chunk::fields(header))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::{HookChain, HookOutcome, HookPoint};
    use meridian_core::checksum::verify_transport_checksum;
    use meridian_core::wire::ipv4::IPV4_MIN_HEADER_LENGTH;
    use meridian_core::wire::udp::UDP_HEADER_LENGTH;
    use std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DEST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn udp_datagram(mode: CrcMode) -> Packet {
        let payload = b"meridian";
        let mut p = Packet::with_chunk("udp-1", Chunk::from_slice(payload));
        let udp_len = UDP_HEADER_LENGTH + payload.len();
        p.insert_at_front(Chunk::fields(UdpHeader {
            src_port: 5000,
            dest_port: 9999,
            total_length: udp_len as u16,
            crc: mode.sentinel(),
            crc_mode: mode,
        }))
        .unwrap();
        p.insert_at_front(Chunk::fields(Ipv4Header {
            total_length: (IPV4_MIN_HEADER_LENGTH + udp_len) as u16,
            protocol: 17,
            src: SRC,
            dest: DEST,
            ..Ipv4Header::default()
        }))
        .unwrap();
        p.set_tag(PacketProtocolTag(protocol::IPV4));
        p
    }

    fn udp_crc(p: &Packet) -> u16 {
        p.peek_at::<UdpHeader>(IPV4_MIN_HEADER_LENGTH).unwrap().crc
    }

    #[test]
    fn computed_udp_checksum_verifies() {
        let mut p = udp_datagram(CrcMode::Computed);
        let mut hook = CrcInsertionHook::new();
        assert_eq!(hook.post_routing(&mut p), Verdict::Accept);
        assert_eq!(hook.inserted(), 1);
        assert_ne!(udp_crc(&p), 0);

        let bytes = p.data_bytes();
        let segment = &bytes[IPV4_MIN_HEADER_LENGTH..];
        let pseudo = pseudo_header(SRC.into(), DEST.into(), 17, segment.len()).unwrap();
        assert!(verify_transport_checksum(&pseudo, segment));
    }

    #[test]
    fn declared_modes_are_untouched() {
        let mut p = udp_datagram(CrcMode::DeclaredCorrect);
        let mut hook = CrcInsertionHook::new();
        hook.post_routing(&mut p);
        assert_eq!(hook.inserted(), 0);
        assert_eq!(udp_crc(&p), 0xC00D);
    }

    #[test]
    fn forwarded_packets_are_skipped() {
        let mut p = udp_datagram(CrcMode::Computed);
        p.set_tag(InterfaceInd(meridian_core::InterfaceId(1)));
        let mut hook = CrcInsertionHook::new();
        hook.post_routing(&mut p);
        assert_eq!(udp_crc(&p), 0);
    }

    #[test]
    fn earlier_drop_keeps_the_hook_from_running() {
        struct DropAll;
        impl NetfilterHook for DropAll {
            fn name(&self) -> &str {
                "drop-all"
            }
            fn post_routing(&mut self, _packet: &mut Packet) -> Verdict {
                Verdict::Drop
            }
        }

        let mut chain = HookChain::new();
        chain.register(CRC_INSERTION_PRIORITY, Box::new(CrcInsertionHook::new()));
        chain.register(5, Box::new(DropAll));
        match chain.run(HookPoint::PostRouting, udp_datagram(CrcMode::Computed)) {
            HookOutcome::Dropped { hook } => assert_eq!(hook, "drop-all"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn icmpv6_checksum_covers_the_pseudo_header() {
        use meridian_core::wire::Icmpv6Type;
        use std::net::Ipv6Addr;

        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dest: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut icmp = Icmpv6Header::echo(Icmpv6Type::EchoRequest, 7, 1);
        icmp.crc_mode = CrcMode::Computed;
        let mut p = Packet::with_chunk("ping", Chunk::from_slice(b"abcd"));
        p.insert_at_front(Chunk::fields(icmp)).unwrap();
        p.insert_at_front(Chunk::fields(Ipv6Header {
            payload_length: 12,
            protocol: 58,
            src,
            dest,
            ..Ipv6Header::default()
        }))
        .unwrap();
        p.set_tag(PacketProtocolTag(protocol::IPV6));

        assert!(insert_crc(&mut p).unwrap());
        let bytes = p.data_bytes();
        let segment = &bytes[40..];
        let pseudo = pseudo_header(src.into(), dest.into(), 58, segment.len()).unwrap();
        assert!(verify_transport_checksum(&pseudo, segment));
    }
}
