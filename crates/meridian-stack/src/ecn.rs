//! ECN codepoints and congestion marking of Ethernet-framed IPv4.
//!
//! Only frames whose EtherType is IPv4 can be marked. Marking rewrites the
//! ECN bits to CE, refreshes the IPv4 header checksum when it is computed
//! and rebuilds the FCS trailer over the new frame bytes.

use meridian_core::wire::ethernet::{
    EthernetFcs, EthernetMacHeader, ETHERNET_FCS_LENGTH, ETHERNET_HEADER_LENGTH, ETHERTYPE_IPV4,
};
use meridian_core::wire::ipv4::Ipv4Header;
use meridian_core::{Chunk, CrcMode, Packet};

use crate::EngineError;

pub const NOT_ECT: u8 = 0;
pub const ECT_1: u8 = 1;
pub const ECT_0: u8 = 2;
pub const CE: u8 = 3;

/// ECT(0) and ECT(1) accept a CE mark.
pub fn is_ect(ecn: u8) -> bool {
    matches!(ecn, ECT_0 | ECT_1)
}

/// The ECN field of an Ethernet frame carrying IPv4, `None` otherwise.
pub fn frame_ecn(frame: &Packet) -> Option<u8> {
    let eth = frame.peek_at_front::<EthernetMacHeader>().ok()?;
    if eth.ether_type != ETHERTYPE_IPV4 {
        return None;
    }
    frame
        .peek_at::<Ipv4Header>(ETHERNET_HEADER_LENGTH)
        .ok()
        .map(|h| h.ecn())
}

/// Set CE on an ECN-capable IPv4 frame. Returns `false`, leaving the frame
/// untouched, when the frame is not IPv4 or its codepoint is not ECT.
///
/// The frame must not have popped regions.
pub fn mark_congestion(frame: &mut Packet) -> Result<bool, EngineError> {
    match frame_ecn(frame) {
        Some(ecn) if is_ect(ecn) => {}
        _ => return Ok(false),
    }
    let has_fcs = frame.data_length() >= ETHERNET_HEADER_LENGTH + ETHERNET_FCS_LENGTH;
    let fcs_mode = if has_fcs {
        let fcs = frame.pop_at_back::<EthernetFcs>(ETHERNET_FCS_LENGTH)?;
        frame.trim_back();
        Some(fcs.mode)
    } else {
        None
    };

    let eth = frame.remove_at_front::<EthernetMacHeader>()?;
    let mut ip = frame.remove_at_front::<Ipv4Header>()?;
    ip.set_ecn(CE);
    if ip.crc_mode == CrcMode::Computed {
        ip.update_crc();
    }
    frame.insert_at_front(Chunk::fields(ip))?;
    frame.insert_at_front(Chunk::fields(eth))?;

    if let Some(mode) = fcs_mode {
        let fcs = EthernetFcs::for_frame(&frame.data_bytes(), mode);
        frame.insert_at_back(Chunk::fields(fcs))?;
    }
    tracing::trace!(packet = frame.name(), "ecn congestion experienced set");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::wire::ethernet::ETHERTYPE_ARP;
    use meridian_core::MacAddress;
    use std::net::Ipv4Addr;

    fn frame(ether_type: u16, ecn: u8, crc: CrcMode) -> Packet {
        let mut ip = Ipv4Header {
            total_length: 28,
            protocol: 17,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(10, 0, 0, 2),
            crc_mode: crc,
            ..Ipv4Header::default()
        };
        ip.set_ecn(ecn);
        ip.update_crc();
        let mut p = Packet::with_chunk("frame", Chunk::zeros(8));
        p.insert_at_front(Chunk::fields(ip)).unwrap();
        p.insert_at_front(Chunk::fields(EthernetMacHeader {
            dest: MacAddress::BROADCAST,
            src: MacAddress([2, 0, 0, 0, 0, 1]),
            ether_type,
        }))
        .unwrap();
        let fcs = EthernetFcs::for_frame(&p.data_bytes(), CrcMode::Computed);
        p.insert_at_back(Chunk::fields(fcs)).unwrap();
        p
    }

    fn fcs_ok(p: &Packet) -> bool {
        let bytes = p.data_bytes();
        let (body, _) = bytes.split_at(bytes.len() - ETHERNET_FCS_LENGTH);
        let mut copy = p.clone();
        let fcs = copy.pop_at_back::<EthernetFcs>(ETHERNET_FCS_LENGTH).unwrap();
        fcs.verify(body)
    }

    #[test]
    fn ect_frame_is_marked_and_checksums_refreshed() {
        let mut p = frame(ETHERTYPE_IPV4, ECT_0, CrcMode::Computed);
        assert!(mark_congestion(&mut p).unwrap());
        assert_eq!(frame_ecn(&p), Some(CE));
        let ip = p.peek_at::<Ipv4Header>(ETHERNET_HEADER_LENGTH).unwrap();
        assert!(ip.computed_crc_ok());
        assert!(fcs_ok(&p));
        assert_eq!(p.data_length(), 14 + 28 + 4);
    }

    #[test]
    fn not_ect_ce_and_non_ip_are_left_alone() {
        for (ether_type, ecn) in [(ETHERTYPE_IPV4, NOT_ECT), (ETHERTYPE_IPV4, CE), (ETHERTYPE_ARP, ECT_1)] {
            let mut p = frame(ether_type, ecn, CrcMode::DeclaredCorrect);
            let before = p.data_bytes();
            assert!(!mark_congestion(&mut p).unwrap());
            assert_eq!(p.data_bytes(), before);
        }
    }

    #[test]
    fn frame_ecn_reads_only_ipv4() {
        assert_eq!(frame_ecn(&frame(ETHERTYPE_IPV4, ECT_1, CrcMode::Disabled)), Some(ECT_1));
        assert_eq!(frame_ecn(&frame(ETHERTYPE_ARP, ECT_1, CrcMode::Disabled)), None);
    }
}
