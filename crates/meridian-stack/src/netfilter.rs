//! Netfilter-style hook chain owned by each L3 engine.
//!
//! Hooks run in ascending priority; equal priorities keep registration
//! order. A `Queue` verdict parks the packet under a ticket. The engine
//! resumes it with `reinject` at the stage right after the hook point it
//! was queued at, skipping the hooks that had not yet run.

use std::collections::BTreeMap;
use std::fmt;

use meridian_core::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Just arrived from the link layer, before routing.
    PreRouting,
    /// About to be delivered locally, after reassembly.
    LocalIn,
    /// Originated here, right after encapsulation.
    LocalOut,
    /// Routed through this node, before fragmentation.
    Forward,
    /// Egress interface and next hop chosen, before fragment-and-send.
    PostRouting,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookPoint::PreRouting => "prerouting",
            HookPoint::LocalIn => "localin",
            HookPoint::LocalOut => "localout",
            HookPoint::Forward => "forward",
            HookPoint::PostRouting => "postrouting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// Park the packet until it is reinjected or dropped.
    Queue,
    /// The hook took the packet. A hook that wants to keep it swaps it out
    /// of the `&mut Packet` it was given.
    Stolen,
}

/// A datagram hook. Every slot defaults to `Accept`.
pub trait NetfilterHook: Send {
    fn name(&self) -> &str;

    fn pre_routing(&mut self, _packet: &mut Packet) -> Verdict {
        Verdict::Accept
    }

    fn local_in(&mut self, _packet: &mut Packet) -> Verdict {
        Verdict::Accept
    }

    fn local_out(&mut self, _packet: &mut Packet) -> Verdict {
        Verdict::Accept
    }

    fn forward(&mut self, _packet: &mut Packet) -> Verdict {
        Verdict::Accept
    }

    fn post_routing(&mut self, _packet: &mut Packet) -> Verdict {
        Verdict::Accept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// Continuation token for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueTicket(u64);

#[derive(Debug)]
pub enum HookOutcome {
    /// Every hook accepted; processing continues with the packet.
    Accept(Packet),
    Dropped { hook: String },
    Queued(QueueTicket),
    Stolen { hook: String },
}

struct Registration {
    handle: HookHandle,
    priority: i32,
    hook: Box<dyn NetfilterHook>,
}

#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Registration>,
    queued: BTreeMap<QueueTicket, (HookPoint, Packet)>,
    next_handle: u64,
    next_ticket: u64,
}

impl fmt::Debug for HookChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookChain")
            .field(
                "hooks",
                &self
                    .hooks
                    .iter()
                    .map(|r| (r.priority, r.hook.name()))
                    .collect::<Vec<_>>(),
            )
            .field("queued", &self.queued.len())
            .finish()
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn register(&mut self, priority: i32, hook: Box<dyn NetfilterHook>) -> HookHandle {
        let handle = HookHandle(self.next_handle);
        self.next_handle += 1;
        // After every hook with priority <= ours keeps equal priorities stable.
        let at = self
            .hooks
            .iter()
            .position(|r| r.priority > priority)
            .unwrap_or(self.hooks.len());
        tracing::debug!(hook = hook.name(), priority, "hook registered");
        self.hooks.insert(
            at,
            Registration {
                handle,
                priority,
                hook,
            },
        );
        handle
    }

    pub fn unregister(&mut self, handle: HookHandle) -> Option<Box<dyn NetfilterHook>> {
        let idx = self.hooks.iter().position(|r| r.handle == handle)?;
        Some(self.hooks.remove(idx).hook)
    }

    /// Run every hook at `point` over `packet`.
    pub fn run(&mut self, point: HookPoint, mut packet: Packet) -> HookOutcome {
        for reg in &mut self.hooks {
            let verdict = match point {
                HookPoint::PreRouting => reg.hook.pre_routing(&mut packet),
                HookPoint::LocalIn => reg.hook.local_in(&mut packet),
                HookPoint::LocalOut => reg.hook.local_out(&mut packet),
                HookPoint::Forward => reg.hook.forward(&mut packet),
                HookPoint::PostRouting => reg.hook.post_routing(&mut packet),
            };
            match verdict {
                Verdict::Accept => continue,
                Verdict::Drop => {
                    tracing::debug!(hook = reg.hook.name(), point = %point, packet = packet.name(), "hook dropped packet");
                    return HookOutcome::Dropped {
                        hook: reg.hook.name().to_string(),
                    };
                }
                Verdict::Stolen => {
                    return HookOutcome::Stolen {
                        hook: reg.hook.name().to_string(),
                    };
                }
                Verdict::Queue => {
                    let ticket = QueueTicket(self.next_ticket);
                    self.next_ticket += 1;
                    tracing::debug!(hook = reg.hook.name(), point = %point, ticket = ticket.0, "packet queued by hook");
                    self.queued.insert(ticket, (point, packet));
                    return HookOutcome::Queued(ticket);
                }
            }
        }
        HookOutcome::Accept(packet)
    }

    /// Take a queued packet back for reinjection.
    pub fn take_queued(&mut self, ticket: QueueTicket) -> Option<(HookPoint, Packet)> {
        self.queued.remove(&ticket)
    }

    pub fn drop_queued(&mut self, ticket: QueueTicket) -> bool {
        self.queued.remove(&ticket).is_some()
    }

    /// Tickets of every parked packet, oldest first.
    pub fn queued_tickets(&self) -> Vec<QueueTicket> {
        self.queued.keys().copied().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Discard every queued packet. Returns how many were discarded.
    pub fn flush(&mut self) -> usize {
        let n = self.queued.len();
        self.queued.clear();
        n
    }
}
