//! Ethernet II framing for the non-loopback interfaces of a node.
//!
//! Outgoing packets carry `InterfaceReq`, `MacAddressReq` and the
//! `PacketProtocolTag` of their payload. Short payloads are padded to the
//! minimum frame size; upper layers strip the padding using their own
//! length fields.

use serde::Serialize;

use meridian_core::protocol::{self, ETHERTYPES};
use meridian_core::tags::{
    DispatchProtocolReq, InterfaceInd, MacAddressInd, MacAddressReq, PacketProtocolTag,
};
use meridian_core::wire::ethernet::{
    EthernetFcs, EthernetMacHeader, ETHERNET_FCS_LENGTH, ETHERNET_HEADER_LENGTH,
    ETHERNET_MIN_PAYLOAD,
};
use meridian_core::{Chunk, CrcMode, Packet};

use crate::interface::NetworkInterface;
use crate::stats::{DropCounters, DropReason};
use crate::EngineError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct EthernetStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub dropped: DropCounters,
}

#[derive(Debug)]
pub struct Ethernet {
    fcs_mode: CrcMode,
    pub stats: EthernetStats,
}

impl Ethernet {
    pub fn new(fcs_mode: CrcMode) -> Self {
        Self {
            fcs_mode,
            stats: EthernetStats::default(),
        }
    }

    /// Frame a packet for `iface`.
    pub fn encapsulate(
        &mut self,
        mut packet: Packet,
        iface: &NetworkInterface,
    ) -> Result<Packet, EngineError> {
        let payload = packet.get_tag::<PacketProtocolTag>()?.0;
        let ether_type = ETHERTYPES
            .find_number(payload)
            .ok_or(EngineError::NoEtherType(payload))?;
        let addresses = packet
            .remove_tag_if_present::<MacAddressReq>()
            .unwrap_or(MacAddressReq {
                src: iface.mac,
                dest: meridian_core::MacAddress::BROADCAST,
            });
        let src = if addresses.src.is_unspecified() {
            iface.mac
        } else {
            addresses.src
        };

        packet.trim();
        let short = ETHERNET_MIN_PAYLOAD.saturating_sub(packet.data_length());
        if short > 0 {
            packet.insert_at_back(Chunk::zeros(short))?;
        }
        packet.insert_at_front(Chunk::fields(EthernetMacHeader {
            dest: addresses.dest,
            src,
            ether_type,
        }))?;
        let fcs = EthernetFcs::for_frame(&packet.data_bytes(), self.fcs_mode);
        packet.insert_at_back(Chunk::fields(fcs))?;
        packet.set_tag(PacketProtocolTag(protocol::ETHERNET_MAC));

        self.stats.frames_sent += 1;
        tracing::trace!(
            packet = packet.name(),
            interface = %iface.name,
            dest = %addresses.dest,
            bytes = packet.data_length(),
            "frame sent"
        );
        Ok(packet)
    }

    /// Check and strip a received frame. `None` means dropped.
    pub fn decapsulate(&mut self, mut frame: Packet, iface: &NetworkInterface) -> Option<Packet> {
        self.stats.frames_received += 1;
        let bytes = frame.data_bytes();
        if bytes.len() < ETHERNET_HEADER_LENGTH + ETHERNET_FCS_LENGTH {
            self.drop_frame(&frame, DropReason::Malformed);
            return None;
        }
        let (body, _) = bytes.split_at(bytes.len() - ETHERNET_FCS_LENGTH);
        let Ok(fcs) = frame.pop_at_back::<EthernetFcs>(ETHERNET_FCS_LENGTH) else {
            self.drop_frame(&frame, DropReason::Malformed);
            return None;
        };
        let errored = frame.bit_error || !frame.is_data_correct();
        if !fcs.verify(body) || (errored && fcs.mode != CrcMode::Disabled) {
            tracing::debug!(packet = frame.name(), interface = %iface.name, "fcs error");
            self.drop_frame(&frame, DropReason::IncorrectlyReceived);
            return None;
        }
        // Errors pass up unchecked when the FCS is disabled.
        if fcs.mode != CrcMode::Disabled {
            frame.bit_error = false;
        }

        let Ok(header) = frame.pop_at_front::<EthernetMacHeader>() else {
            self.drop_frame(&frame, DropReason::Malformed);
            return None;
        };
        let for_us = header.dest == iface.mac
            || header.dest.is_broadcast()
            || (header.dest.is_multicast() && iface.multicast);
        if !for_us {
            tracing::trace!(dest = %header.dest, interface = %iface.name, "frame not for us");
            self.drop_frame(&frame, DropReason::NotAddressedToUs);
            return None;
        }
        let Some(payload) = ETHERTYPES.find_protocol(header.ether_type) else {
            tracing::debug!(ether_type = header.ether_type, "unknown ethertype");
            self.drop_frame(&frame, DropReason::NoProtocolFound);
            return None;
        };

        frame.trim();
        frame.set_tag(InterfaceInd(iface.id));
        frame.set_tag(MacAddressInd {
            src: header.src,
            dest: header.dest,
        });
        frame.set_tag(PacketProtocolTag(payload));
        frame.set_tag(DispatchProtocolReq::indication(payload));
        Some(frame)
    }

    fn drop_frame(&mut self, frame: &Packet, reason: DropReason) {
        tracing::debug!(packet = frame.name(), reason = %reason, "frame dropped");
        self.stats.dropped.record(reason);
    }
}
