//! Drop reasons and the per-engine counters every layer keeps.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Checksum or bit-error check failed.
    IncorrectlyReceived,
    /// Lengths or headers that cannot be parsed.
    Malformed,
    HopLimitReached,
    NoRouteFound,
    NoInterfaceFound,
    ForwardingDisabled,
    AddressResolutionFailed,
    NotAddressedToUs,
    /// A netfilter hook returned `Drop`.
    Filtered,
    Congestion,
    QueueOverflow,
    NoPortFound,
    NoProtocolFound,
    /// Fragment buffer timed out before the datagram was complete.
    ReassemblyTimeout,
    /// Tentative source address never became preferred.
    TentativeAddress,
    Other,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::IncorrectlyReceived => "incorrectly received",
            DropReason::Malformed => "malformed",
            DropReason::HopLimitReached => "hop limit reached",
            DropReason::NoRouteFound => "no route found",
            DropReason::NoInterfaceFound => "no interface found",
            DropReason::ForwardingDisabled => "forwarding disabled",
            DropReason::AddressResolutionFailed => "address resolution failed",
            DropReason::NotAddressedToUs => "not addressed to us",
            DropReason::Filtered => "filtered",
            DropReason::Congestion => "congestion",
            DropReason::QueueOverflow => "queue overflow",
            DropReason::NoPortFound => "no port found",
            DropReason::NoProtocolFound => "no protocol found",
            DropReason::ReassemblyTimeout => "reassembly timeout",
            DropReason::TentativeAddress => "tentative address",
            DropReason::Other => "other",
        };
        f.write_str(s)
    }
}

/// Drop counts keyed by reason. Serializes as a flat JSON object.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct DropCounters(BTreeMap<DropReason, u64>);

impl DropCounters {
    pub fn record(&mut self, reason: DropReason) {
        *self.0.entry(reason).or_insert(0) += 1;
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.0.get(&reason).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}
