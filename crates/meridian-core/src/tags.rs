//! Packet tags: typed side metadata, at most one value per type.
//!
//! `*Req` tags travel down the stack and ask a lower layer for something;
//! `*Ind` tags travel up and report what a lower layer saw.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use crate::address::{InterfaceId, MacAddress, SocketId};
use crate::chunk::Chunk;
use crate::packet::PacketError;
use crate::protocol::Protocol;
use crate::wire::ipv4::Ipv4Option;
use crate::wire::ipv6::Ipv6ExtensionHeader;

// ── Tag set ───────────────────────────────────────────────────────────────────

/// Anything cloneable and thread-safe can be a tag.
pub trait Tag: Any + Clone + fmt::Debug + Send + Sync {}
impl<T: Any + Clone + fmt::Debug + Send + Sync> Tag for T {}

trait ErasedTag: Any + fmt::Debug + Send + Sync {
    fn clone_box(&self) -> Box<dyn ErasedTag>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Tag> ErasedTag for T {
    fn clone_box(&self) -> Box<dyn ErasedTag> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Default)]
pub struct TagSet {
    tags: HashMap<TypeId, Box<dyn ErasedTag>>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn has_tag<T: Tag>(&self) -> bool {
        self.tags.contains_key(&TypeId::of::<T>())
    }

    pub fn find_tag<T: Tag>(&self) -> Option<&T> {
        self.tags
            .get(&TypeId::of::<T>())
            .and_then(|t| ErasedTag::as_any(t.as_ref()).downcast_ref::<T>())
    }

    pub fn find_tag_mut<T: Tag>(&mut self) -> Option<&mut T> {
        self.tags
            .get_mut(&TypeId::of::<T>())
            .and_then(|t| ErasedTag::as_any_mut(t.as_mut()).downcast_mut::<T>())
    }

    pub fn get_tag<T: Tag>(&self) -> Result<&T, PacketError> {
        self.find_tag::<T>()
            .ok_or(PacketError::MissingTag(type_name::<T>()))
    }

    /// Insert `value` unless a tag of this type exists. Returns the stored tag.
    pub fn add_tag_if_absent<T: Tag>(&mut self, value: T) -> &mut T {
        let slot = self
            .tags
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(value));
        // The entry is keyed by `TypeId::of::<T>()`, so it always holds a `T`.
        match ErasedTag::as_any_mut(slot.as_mut()).downcast_mut::<T>() {
            Some(t) => t,
            None => unreachable!("tag stored under the wrong type id"),
        }
    }

    /// Insert or replace.
    pub fn set_tag<T: Tag>(&mut self, value: T) {
        self.tags.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn remove_tag_if_present<T: Tag>(&mut self) -> Option<T> {
        self.tags
            .remove(&TypeId::of::<T>())
            .and_then(|t| ErasedTag::into_any(t).downcast::<T>().ok())
            .map(|b| *b)
    }

    pub fn remove_tag<T: Tag>(&mut self) -> Result<T, PacketError> {
        self.remove_tag_if_present::<T>()
            .ok_or(PacketError::MissingTag(type_name::<T>()))
    }

    /// Replace every tag with a copy of `other`'s.
    pub fn copy_from(&mut self, other: &TagSet) {
        *self = other.clone();
    }

    pub fn clear(&mut self) {
        self.tags.clear();
    }
}

impl Clone for TagSet {
    fn clone(&self) -> Self {
        Self {
            tags: self
                .tags
                .iter()
                .map(|(k, v)| (*k, ErasedTag::clone_box(v.as_ref())))
                .collect(),
        }
    }
}

impl fmt::Debug for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tags.values()).finish()
    }
}

// ── Addressing ────────────────────────────────────────────────────────────────

/// Addresses requested by the sender. An unspecified `src` is filled in by
/// the network layer from the egress interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3AddressReq {
    pub src: IpAddr,
    pub dest: IpAddr,
    /// Permit a source address no local interface owns.
    pub non_local_src: bool,
}

impl L3AddressReq {
    pub fn new(src: IpAddr, dest: IpAddr) -> Self {
        Self {
            src,
            dest,
            non_local_src: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3AddressInd {
    pub src: IpAddr,
    pub dest: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L4PortReq {
    pub src_port: u16,
    pub dest_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L4PortInd {
    pub src_port: u16,
    pub dest_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceReq(pub InterfaceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceInd(pub InterfaceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHopAddressReq(pub IpAddr);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddressReq {
    pub src: MacAddress,
    pub dest: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddressInd {
    pub src: MacAddress,
    pub dest: MacAddress,
}

// ── Protocols and dispatch ────────────────────────────────────────────────────

/// Protocol of the outermost header in the packet's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketProtocolTag(pub Protocol);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServicePrimitive {
    Request,
    Indication,
    Confirm,
    Response,
}

/// Where the dispatcher should deliver the packet next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchProtocolReq {
    pub protocol: Protocol,
    /// `None` lets the dispatcher infer it from `PacketProtocolTag`.
    pub primitive: Option<ServicePrimitive>,
}

impl DispatchProtocolReq {
    pub fn request(protocol: Protocol) -> Self {
        Self {
            protocol,
            primitive: Some(ServicePrimitive::Request),
        }
    }

    pub fn indication(protocol: Protocol) -> Self {
        Self {
            protocol,
            primitive: Some(ServicePrimitive::Indication),
        }
    }
}

/// Protocol that handed the packet up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchProtocolInd(pub Protocol);

/// Network protocol a transport payload arrived under, with its header.
#[derive(Debug, Clone)]
pub struct NetworkProtocolInd {
    pub protocol: Protocol,
    pub header: Chunk,
}

// ── Per-datagram IP options ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopLimitReq(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopLimitInd(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DscpReq(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DscpInd(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnReq(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcnInd(pub u8);

/// Whole type-of-service byte. Mutually exclusive with `DscpReq`/`EcnReq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TosReq(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TosInd(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentationReq {
    pub dont_fragment: bool,
}

/// Multicast socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MulticastReq {
    /// Deliver a copy of outgoing multicast to the local host.
    pub multicast_loop: bool,
    /// Egress interface chosen by the application.
    pub interface: Option<InterfaceId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4OptionsReq(pub Vec<Ipv4Option>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6ExtHeaderReq(pub Vec<Ipv6ExtensionHeader>);

// ── Sockets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketReq(pub SocketId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInd(pub SocketId);
