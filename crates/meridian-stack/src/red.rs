//! Random early detection in front of an interface's transmit queue.
//!
//! `RedMarker` holds the averaged queue length and the count since the
//! last mark, and turns a queue length into a decision. `RedQueue` applies
//! the decision to Ethernet frames: ECN-capable IPv4 is marked CE, anything
//! else selected for marking is dropped.

use std::collections::VecDeque;

use rand::{Rng, RngCore};
use serde::Serialize;

use meridian_core::config::RedConfig;
use meridian_core::{Packet, SimTime};

use crate::ecn;
use crate::stats::{DropCounters, DropReason};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedDecision {
    Send,
    /// Congestion signal: mark if possible, drop otherwise.
    Mark,
    /// Queue full.
    Overflow,
}

#[derive(Debug, Clone)]
pub struct RedMarker {
    capacity: usize,
    min_threshold: f64,
    max_threshold: f64,
    max_probability: f64,
    weight: f64,
    packet_rate: f64,
    avg: f64,
    /// Packets since the last mark; -1 outside the probabilistic region.
    count: i64,
    /// When the queue last became empty.
    idle_since: SimTime,
}

impl RedMarker {
    pub fn new(config: &RedConfig) -> Self {
        Self {
            capacity: config.capacity,
            min_threshold: config.min_threshold,
            max_threshold: config.max_threshold,
            max_probability: config.max_probability,
            weight: config.weight,
            packet_rate: config.packet_rate,
            avg: 0.0,
            count: -1,
            idle_since: SimTime::ZERO,
        }
    }

    pub fn average(&self) -> f64 {
        self.avg
    }

    /// The queue just drained; the average decays from here on.
    pub fn queue_emptied(&mut self, now: SimTime) {
        self.idle_since = now;
    }

    fn update_average(&mut self, queue_length: usize, now: SimTime) {
        if queue_length > 0 {
            self.avg = (1.0 - self.weight) * self.avg + self.weight * queue_length as f64;
        } else {
            let idle = now.saturating_sub(self.idle_since).as_secs_f64();
            let m = idle * self.packet_rate;
            self.avg *= (1.0 - self.weight).powf(m);
        }
    }

    /// Base marking probability for an average, before the count
    /// correction: 0 below the minimum threshold, 1 at or above the maximum.
    pub fn base_probability(&self, avg: f64) -> f64 {
        if avg < self.min_threshold {
            0.0
        } else if avg >= self.max_threshold {
            1.0
        } else {
            self.max_probability * (avg - self.min_threshold)
                / (self.max_threshold - self.min_threshold)
        }
    }

    /// Update the average with the arriving packet's view of the queue and
    /// decide what to do with it.
    pub fn decide(&mut self, queue_length: usize, now: SimTime, rng: &mut dyn RngCore) -> RedDecision {
        self.update_average(queue_length, now);

        if queue_length >= self.capacity {
            self.count = 0;
            return RedDecision::Overflow;
        }
        let avg = self.avg;
        if avg >= self.min_threshold && avg < self.max_threshold {
            self.count += 1;
            let p = self.base_probability(avg);
            let denominator = 1.0 - self.count as f64 * p;
            let pa = if denominator <= 0.0 { 1.0 } else { p / denominator };
            if rng.gen::<f64>() < pa {
                self.count = 0;
                return RedDecision::Mark;
            }
            RedDecision::Send
        } else if avg >= self.max_threshold {
            self.count = 0;
            RedDecision::Mark
        } else {
            self.count = -1;
            RedDecision::Send
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RedStats {
    pub enqueued: u64,
    pub marked: u64,
    /// Marks moved to a later packet because the selected one was already CE.
    pub deferred_marks: u64,
    pub dropped: DropCounters,
}

/// Transmit queue of Ethernet frames guarded by a RED marker.
#[derive(Debug)]
pub struct RedQueue {
    marker: RedMarker,
    use_ecn: bool,
    /// A mark could not be applied; put it on the next ECN-capable frame.
    mark_next: bool,
    queue: VecDeque<Packet>,
    pub stats: RedStats,
}

impl RedQueue {
    pub fn new(config: &RedConfig) -> Self {
        Self {
            marker: RedMarker::new(config),
            use_ecn: config.use_ecn,
            mark_next: false,
            queue: VecDeque::new(),
            stats: RedStats::default(),
        }
    }

    pub fn marker(&self) -> &RedMarker {
        &self.marker
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Offer a frame. Returns `false` if it was dropped.
    pub fn enqueue(
        &mut self,
        mut frame: Packet,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<bool, EngineError> {
        let decision = self.marker.decide(self.queue.len(), now, rng);
        match decision {
            RedDecision::Overflow => {
                tracing::debug!(packet = frame.name(), queue = self.queue.len(), "red queue full");
                self.stats.dropped.record(DropReason::QueueOverflow);
                return Ok(false);
            }
            RedDecision::Mark => {
                let codepoint = if self.use_ecn { ecn::frame_ecn(&frame) } else { None };
                match codepoint {
                    Some(ecn::CE) => {
                        tracing::trace!(packet = frame.name(), "already ce, deferring mark");
                        self.mark_next = true;
                        self.stats.deferred_marks += 1;
                    }
                    Some(c) if ecn::is_ect(c) => {
                        ecn::mark_congestion(&mut frame)?;
                        self.mark_next = false;
                        self.stats.marked += 1;
                    }
                    _ => {
                        tracing::debug!(
                            packet = frame.name(),
                            avg = self.marker.average(),
                            "red early drop"
                        );
                        self.stats.dropped.record(DropReason::Congestion);
                        return Ok(false);
                    }
                }
            }
            RedDecision::Send => {
                if self.mark_next && ecn::mark_congestion(&mut frame)? {
                    self.mark_next = false;
                    self.stats.marked += 1;
                }
            }
        }
        self.queue.push_back(frame);
        self.stats.enqueued += 1;
        Ok(true)
    }

    pub fn dequeue(&mut self, now: SimTime) -> Option<Packet> {
        let frame = self.queue.pop_front()?;
        if self.queue.is_empty() {
            self.marker.queue_emptied(now);
        }
        Some(frame)
    }

    /// Discard queued frames. Returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::checksum::CrcMode;
    use meridian_core::wire::ethernet::{EthernetFcs, EthernetMacHeader, ETHERNET_HEADER_LENGTH, ETHERTYPE_IPV4};
    use meridian_core::wire::ipv4::Ipv4Header;
    use meridian_core::{Chunk, MacAddress};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn scenario() -> RedConfig {
        RedConfig {
            enabled: true,
            capacity: 20,
            min_threshold: 5.0,
            max_threshold: 15.0,
            max_probability: 0.1,
            weight: 1.0,
            packet_rate: 150.0,
            use_ecn: true,
        }
    }

    fn frame(ecn: u8) -> Packet {
        let mut ip = Ipv4Header {
            total_length: 20,
            ..Ipv4Header::default()
        };
        ip.set_ecn(ecn);
        let mut p = Packet::with_chunk("f", Chunk::fields(ip));
        p.insert_at_front(Chunk::fields(EthernetMacHeader {
            dest: MacAddress::BROADCAST,
            src: MacAddress([2, 0, 0, 0, 0, 1]),
            ether_type: ETHERTYPE_IPV4,
        }))
        .unwrap();
        let fcs = EthernetFcs::for_frame(&p.data_bytes(), CrcMode::DeclaredCorrect);
        p.insert_at_back(Chunk::fields(fcs)).unwrap();
        p
    }

    fn ecn_of(p: &Packet) -> u8 {
        p.peek_at::<Ipv4Header>(ETHERNET_HEADER_LENGTH).unwrap().ecn()
    }

    #[test]
    fn full_queue_always_drops() {
        let mut red = RedMarker::new(&scenario());
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..200 {
            let now = Duration::from_millis(i);
            assert_eq!(red.decide(20, now, &mut rng), RedDecision::Overflow);
        }
    }

    #[test]
    fn short_queue_never_marks() {
        let mut red = RedMarker::new(&scenario());
        let mut rng = StdRng::seed_from_u64(2);
        for i in 0..200 {
            let now = Duration::from_millis(i);
            assert_eq!(red.decide(3, now, &mut rng), RedDecision::Send);
            assert_eq!(red.average(), 3.0);
        }
    }

    #[test]
    fn above_max_threshold_always_marks() {
        let mut red = RedMarker::new(&scenario());
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            assert_eq!(red.decide(16, SimTime::ZERO, &mut rng), RedDecision::Mark);
        }
    }

    #[test]
    fn probability_is_monotone_in_average() {
        let red = RedMarker::new(&scenario());
        let mut last = 0.0;
        for tenth in 0..=200 {
            let p = red.base_probability(f64::from(tenth) / 10.0);
            assert!(p >= last, "probability fell at avg {}", f64::from(tenth) / 10.0);
            last = p;
        }
        assert_eq!(red.base_probability(4.9), 0.0);
        assert_eq!(red.base_probability(15.0), 1.0);
    }

    #[test]
    fn count_correction_forces_a_mark() {
        let mut red = RedMarker::new(&scenario());
        let mut rng = StdRng::seed_from_u64(4);
        // p = 0.05 at avg 10; pa reaches 1 by the 20th packet.
        let marks = (0..40)
            .filter(|_| red.decide(10, SimTime::ZERO, &mut rng) == RedDecision::Mark)
            .count();
        assert!(marks >= 2);
    }

    #[test]
    fn idle_queue_decays_average() {
        let config = RedConfig {
            weight: 0.5,
            ..scenario()
        };
        let mut red = RedMarker::new(&config);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..20 {
            red.decide(10, SimTime::ZERO, &mut rng);
        }
        assert!(red.average() > 9.9);
        red.queue_emptied(SimTime::ZERO);
        red.decide(0, Duration::from_millis(100), &mut rng);
        assert!(red.average() < 0.001);
    }

    #[test]
    fn ect_frames_are_marked_and_others_dropped() {
        let config = RedConfig {
            min_threshold: 0.0,
            max_threshold: 0.5,
            ..scenario()
        };
        let mut q = RedQueue::new(&config);
        let mut rng = StdRng::seed_from_u64(6);
        q.enqueue(frame(ecn::ECT_0), SimTime::ZERO, &mut rng).unwrap();
        // Queue now non-empty, average 1 > max threshold.
        assert!(q.enqueue(frame(ecn::ECT_1), SimTime::ZERO, &mut rng).unwrap());
        assert!(!q.enqueue(frame(ecn::NOT_ECT), SimTime::ZERO, &mut rng).unwrap());
        assert_eq!(q.stats.marked, 1);
        assert_eq!(q.stats.dropped.get(DropReason::Congestion), 1);
        assert_eq!(q.len(), 2);
        let _ = q.dequeue(SimTime::ZERO);
        assert_eq!(ecn_of(&q.dequeue(SimTime::ZERO).unwrap()), ecn::CE);
    }

    #[test]
    fn mark_on_ce_frame_moves_to_next_frame() {
        let config = RedConfig {
            min_threshold: 1.5,
            max_threshold: 1.6,
            capacity: 100,
            ..scenario()
        };
        let mut q = RedQueue::new(&config);
        let mut rng = StdRng::seed_from_u64(7);
        // Queue lengths 0 and 1 stay below the minimum threshold.
        q.enqueue(frame(ecn::ECT_0), SimTime::ZERO, &mut rng).unwrap();
        q.enqueue(frame(ecn::ECT_0), SimTime::ZERO, &mut rng).unwrap();
        // Queue length 2: mark selected, frame already CE.
        q.enqueue(frame(ecn::CE), SimTime::ZERO, &mut rng).unwrap();
        assert_eq!(q.stats.deferred_marks, 1);
        // Drain and stay idle long enough for the average to decay.
        for _ in 0..3 {
            q.dequeue(SimTime::ZERO);
        }
        let later = Duration::from_secs(1);
        q.enqueue(frame(ecn::ECT_1), later, &mut rng).unwrap();
        assert!(q.marker().average() < 1.5);
        assert_eq!(q.stats.marked, 1);
        assert_eq!(ecn_of(&q.dequeue(SimTime::ZERO).unwrap()), ecn::CE);
    }

    #[test]
    fn deferred_mark_is_spent_by_the_next_marked_frame() {
        let config = RedConfig {
            min_threshold: 1.5,
            max_threshold: 1.6,
            capacity: 100,
            ..scenario()
        };
        let mut q = RedQueue::new(&config);
        let mut rng = StdRng::seed_from_u64(7);
        q.enqueue(frame(ecn::ECT_0), SimTime::ZERO, &mut rng).unwrap();
        q.enqueue(frame(ecn::ECT_0), SimTime::ZERO, &mut rng).unwrap();
        q.enqueue(frame(ecn::CE), SimTime::ZERO, &mut rng).unwrap();
        assert_eq!(q.stats.deferred_marks, 1);
        // Queue length 3: marked directly, which also settles the deferred mark.
        q.enqueue(frame(ecn::ECT_1), SimTime::ZERO, &mut rng).unwrap();
        assert_eq!(q.stats.marked, 1);
        for _ in 0..4 {
            q.dequeue(SimTime::ZERO);
        }

        let later = Duration::from_secs(1);
        q.enqueue(frame(ecn::ECT_0), later, &mut rng).unwrap();
        assert!(q.marker().average() < 1.5);
        assert_eq!(q.stats.marked, 1);
        assert_eq!(ecn_of(&q.dequeue(later).unwrap()), ecn::ECT_0);
    }

    #[test]
    fn overflow_is_counted() {
        let config = RedConfig {
            capacity: 2,
            min_threshold: 10.0,
            max_threshold: 20.0,
            ..scenario()
        };
        let mut q = RedQueue::new(&config);
        let mut rng = StdRng::seed_from_u64(8);
        for _ in 0..3 {
            q.enqueue(frame(ecn::NOT_ECT), SimTime::ZERO, &mut rng).unwrap();
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.stats.dropped.get(DropReason::QueueOverflow), 1);
        assert_eq!(q.clear(), 2);
    }
}
