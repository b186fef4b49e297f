//! Raw IP socket descriptors kept by the L3 engines.
//!
//! A raw socket receives a copy of every locally delivered datagram whose
//! transport protocol, destination and source match its binding. Unset
//! fields match anything.

use std::collections::BTreeMap;
use std::net::IpAddr;

use meridian_core::tags::SocketReq;
use meridian_core::{Protocol, SocketId};

use crate::dispatcher::{Command, SocketCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSocket {
    pub id: SocketId,
    pub protocol: Option<Protocol>,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
}

impl RawSocket {
    fn new(id: SocketId) -> Self {
        Self {
            id,
            protocol: None,
            local: None,
            remote: None,
        }
    }

    fn matches(&self, protocol: Protocol, local: IpAddr, remote: IpAddr) -> bool {
        self.protocol.map_or(true, |p| p == protocol)
            && self.local.map_or(true, |a| a == local)
            && self.remote.map_or(true, |a| a == remote)
    }
}

fn specified(address: IpAddr) -> Option<IpAddr> {
    (!address.is_unspecified()).then_some(address)
}

#[derive(Debug, Default)]
pub struct RawSocketTable {
    sockets: BTreeMap<SocketId, RawSocket>,
}

impl RawSocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn get(&self, id: SocketId) -> Option<&RawSocket> {
        self.sockets.get(&id)
    }

    pub fn bind(&mut self, id: SocketId, protocol: Option<Protocol>, local: IpAddr) {
        let socket = self.sockets.entry(id).or_insert_with(|| RawSocket::new(id));
        socket.protocol = protocol;
        socket.local = specified(local);
        tracing::debug!(socket = %id, protocol = ?protocol, local = %local, "raw socket bound");
    }

    pub fn connect(&mut self, id: SocketId, remote: IpAddr) {
        let socket = self.sockets.entry(id).or_insert_with(|| RawSocket::new(id));
        socket.remote = specified(remote);
    }

    pub fn close(&mut self, id: SocketId) -> bool {
        self.sockets.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.sockets.clear();
    }

    /// Apply a socket command that came down from the dispatcher. Returns
    /// the `Closed` indication to send back up after a close.
    pub fn handle_command(&mut self, command: &Command) -> Option<Command> {
        let SocketReq(id) = *command.tags.find_tag::<SocketReq>()?;
        match &command.kind {
            SocketCommand::Bind { protocol, local } => self.bind(id, *protocol, *local),
            SocketCommand::Connect { remote } => self.connect(id, *remote),
            SocketCommand::Close => {
                self.close(id);
                let mut closed = Command::new(SocketCommand::Closed);
                closed.tags.set_tag(meridian_core::tags::SocketInd(id));
                return Some(closed);
            }
            SocketCommand::Closed => {}
        }
        None
    }

    /// Sockets that should get a copy of a datagram, in id order.
    pub fn matching(&self, protocol: Protocol, local: IpAddr, remote: IpAddr) -> Vec<SocketId> {
        self.sockets
            .values()
            .filter(|s| s.matches(protocol, local, remote))
            .map(|s| s.id)
            .collect()
    }
}
