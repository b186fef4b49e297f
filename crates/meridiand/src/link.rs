//! Point-to-point links carrying serialized Ethernet frames.
//!
//! Each direction is an independent channel: a frame occupies it for its
//! serialization time at the configured data rate, then arrives after the
//! propagation delay. Bit errors are drawn per frame from the bit error
//! rate and reported to the receiver rather than applied to the bytes.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use serde::Serialize;

use meridian_core::config::LinkConfig;
use meridian_core::{InterfaceId, SimTime};

/// One end of a link: a node index and its interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub node: usize,
    pub interface: InterfaceId,
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub arrives: SimTime,
    pub bytes: Bytes,
    pub bit_error: bool,
}

#[derive(Debug, Default)]
struct Channel {
    busy_until: SimTime,
    in_flight: VecDeque<InFlight>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub frames: u64,
    pub bytes: u64,
    pub corrupted: u64,
}

/// Direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::AToB, Direction::BToA];

    fn index(self) -> usize {
        match self {
            Direction::AToB => 0,
            Direction::BToA => 1,
        }
    }
}

#[derive(Debug)]
pub struct Link {
    pub name: String,
    pub a: Endpoint,
    pub b: Endpoint,
    delay: Duration,
    datarate_bps: u64,
    bit_error_rate: f64,
    channels: [Channel; 2],
    pub stats: LinkStats,
}

impl Link {
    pub fn new(config: &LinkConfig, a: Endpoint, b: Endpoint) -> Self {
        Self {
            name: format!("{}<->{}", config.a, config.b),
            a,
            b,
            delay: Duration::from_millis(config.delay_millis),
            datarate_bps: config.datarate_bps,
            bit_error_rate: config.bit_error_rate,
            channels: [Channel::default(), Channel::default()],
            stats: LinkStats::default(),
        }
    }

    /// Sender and receiver for `dir`.
    pub fn ends(&self, dir: Direction) -> (Endpoint, Endpoint) {
        match dir {
            Direction::AToB => (self.a, self.b),
            Direction::BToA => (self.b, self.a),
        }
    }

    /// True while a frame is still being serialized onto `dir`.
    pub fn is_busy(&self, dir: Direction, now: SimTime) -> bool {
        now < self.channels[dir.index()].busy_until
    }

    /// Start sending `bytes` at `now`. The caller checks `is_busy` first.
    pub fn transmit(&mut self, dir: Direction, bytes: Bytes, now: SimTime, rng: &mut impl Rng) {
        let bits = bytes.len() as u64 * 8;
        let serialization = if self.datarate_bps == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(bits as f64 / self.datarate_bps as f64)
        };
        let bit_error = self.bit_error_rate > 0.0
            && rng.gen::<f64>() < 1.0 - (1.0 - self.bit_error_rate).powf(bits as f64);

        self.stats.frames += 1;
        self.stats.bytes += bytes.len() as u64;
        if bit_error {
            self.stats.corrupted += 1;
        }
        let channel = &mut self.channels[dir.index()];
        let start = now.max(channel.busy_until);
        channel.busy_until = start + serialization;
        tracing::trace!(link = %self.name, bytes = bytes.len(), bit_error, "frame on the wire");
        channel.in_flight.push_back(InFlight {
            arrives: start + serialization + self.delay,
            bytes,
            bit_error,
        });
    }

    /// Frames on `dir` that have arrived by `now`, in sending order.
    pub fn arrivals(&mut self, dir: Direction, now: SimTime) -> Vec<InFlight> {
        let channel = &mut self.channels[dir.index()];
        let mut out = Vec::new();
        while channel.in_flight.front().is_some_and(|f| f.arrives <= now) {
            if let Some(f) = channel.in_flight.pop_front() {
                out.push(f);
            }
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.channels.iter().map(|c| c.in_flight.len()).sum()
    }
}
