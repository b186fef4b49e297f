//! Fragment reassembly shared by the IPv4 and IPv6 engines.
//!
//! A buffer per datagram key collects payload ranges in any order. The
//! datagram is handed back once `[0, total)` is covered, where `total` is
//! learned from the fragment without the more-fragments flag. Overlapping
//! ranges keep the bytes that arrived at the lower offset.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use meridian_core::{Chunk, Packet, SimTime};

/// One received fragment, already split into header and payload.
#[derive(Debug)]
pub struct Fragment<H> {
    pub header: H,
    /// Payload offset in bytes.
    pub offset: usize,
    pub more_fragments: bool,
    pub payload: Chunk,
    /// The fragment itself, positioned at its network header. Kept for the
    /// first fragment so the completed datagram inherits its tags and a
    /// timeout can be reported against it.
    pub packet: Packet,
}

/// A completed datagram.
#[derive(Debug)]
pub struct Reassembled<H> {
    /// Header of the fragment at offset 0.
    pub header: H,
    /// The offset-0 fragment.
    pub first: Packet,
    /// Payload pieces in order, overlaps removed.
    pub payload: Vec<Chunk>,
    pub payload_length: usize,
}

#[derive(Debug)]
struct Buffer<H> {
    first: Option<(H, Packet)>,
    pieces: BTreeMap<usize, Chunk>,
    total: Option<usize>,
    created: SimTime,
}

impl<H> Buffer<H> {
    fn new(created: SimTime) -> Self {
        Self {
            first: None,
            pieces: BTreeMap::new(),
            total: None,
            created,
        }
    }

    /// Contiguous pieces covering `[0, total)`, or `None` while a hole
    /// remains.
    fn assemble(&self) -> Option<(Vec<Chunk>, usize)> {
        let total = self.total?;
        let mut covered = 0;
        let mut out = Vec::new();
        for (&start, chunk) in &self.pieces {
            if covered >= total {
                break;
            }
            let end = start + chunk.len();
            if start > covered {
                return None;
            }
            if end <= covered {
                continue;
            }
            let end = end.min(total);
            out.push(chunk.slice(covered - start, end - covered));
            covered = end;
        }
        (covered >= total).then_some((out, total))
    }
}

#[derive(Debug)]
pub struct ReassemblyBuffer<K, H> {
    buffers: HashMap<K, Buffer<H>>,
}

impl<K, H> Default for ReassemblyBuffer<K, H> {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, H> ReassemblyBuffer<K, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Datagrams with at least one fragment outstanding.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Add one fragment. Returns the datagram if this fragment completed it.
    pub fn add_fragment(
        &mut self,
        key: K,
        fragment: Fragment<H>,
        now: SimTime,
    ) -> Option<Reassembled<H>> {
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| Buffer::new(now));
        let end = fragment.offset + fragment.payload.len();
        if !fragment.more_fragments {
            buffer.total = Some(end);
        }
        if fragment.offset == 0 && buffer.first.is_none() {
            buffer.first = Some((fragment.header, fragment.packet));
        }
        // A longer piece at the same offset replaces a shorter one.
        let replace = buffer
            .pieces
            .get(&fragment.offset)
            .map_or(true, |old| old.len() < fragment.payload.len());
        if replace {
            buffer.pieces.insert(fragment.offset, fragment.payload);
        }

        buffer.first.as_ref()?;
        let (payload, payload_length) = buffer.assemble()?;
        let buffer = self.buffers.remove(&key)?;
        let (header, first) = buffer.first?;
        tracing::debug!(key = ?key, payload_length, "datagram reassembled");
        Some(Reassembled {
            header,
            first,
            payload,
            payload_length,
        })
    }

    /// Drop buffers created before `cutoff`. Returns the offset-0 fragment
    /// of each dropped datagram that had one.
    pub fn purge(&mut self, cutoff: SimTime) -> Vec<Packet> {
        let stale: Vec<K> = self
            .buffers
            .iter()
            .filter(|(_, b)| b.created < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        let mut firsts = Vec::new();
        for key in stale {
            if let Some(buffer) = self.buffers.remove(&key) {
                tracing::debug!(key = ?key, "reassembly timed out");
                if let Some((_, packet)) = buffer.first {
                    firsts.push(packet);
                }
            }
        }
        firsts
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SECOND: Duration = Duration::from_secs(1);

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn split(data: &[u8], size: usize) -> Vec<Fragment<&'static str>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + size).min(data.len());
            out.push(Fragment {
                header: "hdr",
                offset,
                more_fragments: end < data.len(),
                payload: Chunk::from_slice(&data[offset..end]),
                packet: Packet::new(format!("frag-{offset}")),
            });
            offset = end;
        }
        out
    }

    fn join(done: &Reassembled<&'static str>) -> Vec<u8> {
        done.payload
            .iter()
            .flat_map(|c| c.to_bytes().to_vec())
            .collect()
    }

    #[test]
    fn single_fragment_completes_immediately() {
        let data = payload(100);
        let mut buf = ReassemblyBuffer::new();
        let mut frags = split(&data, 200);
        assert_eq!(frags.len(), 1);
        let done = buf.add_fragment(1u16, frags.remove(0), SECOND).unwrap();
        assert_eq!(join(&done), data);
        assert!(buf.is_empty());
    }

    #[test]
    fn n_fragments_and_one_extra_byte() {
        for len in [1480 * 3, 1480 * 3 + 1] {
            let data = payload(len);
            let mut buf = ReassemblyBuffer::new();
            let frags = split(&data, 1480);
            let count = frags.len();
            let mut done = None;
            for (i, f) in frags.into_iter().enumerate() {
                done = buf.add_fragment(7u16, f, SECOND);
                assert_eq!(done.is_some(), i + 1 == count);
            }
            let done = done.unwrap();
            assert_eq!(done.payload_length, len);
            assert_eq!(join(&done), data);
        }
    }

    #[test]
    fn any_arrival_order() {
        let data = payload(4000);
        let mut buf = ReassemblyBuffer::new();
        let mut frags = split(&data, 1000);
        frags.reverse();
        frags.swap(1, 2);
        let mut results: Vec<_> = frags
            .into_iter()
            .filter_map(|f| buf.add_fragment(3u16, f, SECOND))
            .collect();
        assert_eq!(results.len(), 1);
        let done = results.remove(0);
        assert_eq!(done.first.name(), "frag-0");
        assert_eq!(join(&done), data);
    }

    #[test]
    fn overlapping_ranges_are_trimmed() {
        let data = payload(300);
        let mut buf = ReassemblyBuffer::new();
        let piece = |offset: usize, end: usize, more: bool| Fragment {
            header: "hdr",
            offset,
            more_fragments: more,
            payload: Chunk::from_slice(&data[offset..end]),
            packet: Packet::new("f"),
        };
        assert!(buf.add_fragment(1u8, piece(0, 160, true), SECOND).is_none());
        assert!(buf.add_fragment(1u8, piece(200, 300, false), SECOND).is_none());
        let done = buf.add_fragment(1u8, piece(120, 240, true), SECOND).unwrap();
        assert_eq!(done.payload_length, 300);
        assert_eq!(join(&done), data);
    }

    #[test]
    fn keys_are_independent() {
        let data = payload(200);
        let mut buf = ReassemblyBuffer::new();
        let mut a = split(&data, 100);
        let mut b = split(&data, 100);
        assert!(buf.add_fragment(1u8, a.remove(0), SECOND).is_none());
        assert!(buf.add_fragment(2u8, b.remove(1), SECOND).is_none());
        assert_eq!(buf.len(), 2);
        assert!(buf.add_fragment(1u8, a.remove(0), SECOND).is_some());
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn purge_returns_first_fragments_only() {
        let data = payload(300);
        let mut buf = ReassemblyBuffer::new();
        let mut with_first = split(&data, 100);
        let mut without_first = split(&data, 100);
        buf.add_fragment(1u8, with_first.remove(0), SECOND);
        buf.add_fragment(2u8, without_first.remove(2), SECOND);
        buf.add_fragment(3u8, split(&data, 100).remove(0), SECOND * 40);

        let stale = buf.purge(SECOND * 30);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name(), "frag-0");
        assert_eq!(buf.len(), 1);
    }
}
