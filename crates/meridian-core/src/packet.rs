//! Packet: an ordered chunk sequence with front and back cursors, plus tags.
//!
//! ```text
//!   |<- front_offset ->|<---- data_length ---->|<- back_offset ->|
//!   |<------------------------ total_length ------------------->|
//! ```
//!
//! Popping moves a cursor inward; the popped bytes stay in the chunk
//! sequence until `trim()`. Inserting is only allowed on a side whose popped
//! region is empty.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::chunk::{Chunk, Header};
use crate::tags::{Tag, TagSet};
use crate::wire::WireError;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("incomplete chunk: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },
    #[error("chunk is marked incorrect")]
    Incorrect,
    #[error("malformed packet: {0}")]
    Malformed(WireError),
    #[error("range {offset}+{length} outside data region of {data_length} bytes")]
    OutOfRange {
        offset: usize,
        length: usize,
        data_length: usize,
    },
    #[error("cannot insert while the popped region is non-empty")]
    PoppedRegionNotEmpty,
    #[error("missing tag {0}")]
    MissingTag(&'static str),
}

impl From<WireError> for PacketError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Truncated { need, have } => PacketError::Incomplete { need, have },
            other => PacketError::Malformed(other),
        }
    }
}

/// Relaxations for a peek.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeekFlags {
    /// Zero-fill missing bytes instead of failing.
    pub allow_incomplete: bool,
    /// Return headers whose bytes are marked incorrect.
    pub allow_incorrect: bool,
}

impl PeekFlags {
    pub const STRICT: PeekFlags = PeekFlags {
        allow_incomplete: false,
        allow_incorrect: false,
    };
    pub const ALLOW_INCORRECT: PeekFlags = PeekFlags {
        allow_incomplete: false,
        allow_incorrect: true,
    };
}

/// A relaxed peek result.
#[derive(Debug, Clone)]
pub struct Peeked<T> {
    pub header: T,
    pub correct: bool,
    pub complete: bool,
}

// ── Packet ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Packet {
    name: String,
    chunks: VecDeque<Chunk>,
    front_offset: usize,
    back_offset: usize,
    pub tags: TagSet,
    /// Whole-packet bit error reported by the link layer.
    pub bit_error: bool,
}

impl Packet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunks: VecDeque::new(),
            front_offset: 0,
            back_offset: 0,
            tags: TagSet::new(),
            bit_error: false,
        }
    }

    pub fn with_chunk(name: impl Into<String>, chunk: Chunk) -> Self {
        let mut p = Self::new(name);
        p.chunks.push_back(chunk);
        p
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // ── Lengths ──────────────────────────────────────────────────────────────

    pub fn total_length(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn data_length(&self) -> usize {
        self.total_length() - self.front_offset - self.back_offset
    }

    /// Length of the whole packet on the wire, popped regions included.
    pub fn byte_length(&self) -> usize {
        self.total_length()
    }

    pub fn front_offset(&self) -> usize {
        self.front_offset
    }

    pub fn back_offset(&self) -> usize {
        self.back_offset
    }

    /// Move the front cursor to an absolute position.
    pub fn set_front_offset(&mut self, offset: usize) -> Result<(), PacketError> {
        let limit = self.total_length() - self.back_offset;
        if offset > limit {
            return Err(self.out_of_range(offset, 0));
        }
        self.front_offset = offset;
        Ok(())
    }

    /// Place the end of the data region at absolute position `end`.
    pub fn set_back_offset(&mut self, end: usize) -> Result<(), PacketError> {
        let total = self.total_length();
        if end < self.front_offset || end > total {
            return Err(self.out_of_range(end, 0));
        }
        self.back_offset = total - end;
        Ok(())
    }

    // ── Tags ─────────────────────────────────────────────────────────────────

    pub fn find_tag<T: Tag>(&self) -> Option<&T> {
        self.tags.find_tag::<T>()
    }

    pub fn get_tag<T: Tag>(&self) -> Result<&T, PacketError> {
        self.tags.get_tag::<T>()
    }

    pub fn set_tag<T: Tag>(&mut self, value: T) {
        self.tags.set_tag(value);
    }

    pub fn add_tag_if_absent<T: Tag>(&mut self, value: T) -> &mut T {
        self.tags.add_tag_if_absent(value)
    }

    pub fn remove_tag_if_present<T: Tag>(&mut self) -> Option<T> {
        self.tags.remove_tag_if_present::<T>()
    }

    // ── Peek / pop ───────────────────────────────────────────────────────────

    pub fn peek_at_front<T: Header>(&self) -> Result<T, PacketError> {
        self.peek_at(0)
    }

    /// Parse a `T` at `offset` bytes into the data region.
    pub fn peek_at<T: Header>(&self, offset: usize) -> Result<T, PacketError> {
        self.peek_at_with::<T>(offset, PeekFlags::STRICT)
            .map(|p| p.header)
    }

    pub fn peek_at_with<T: Header>(
        &self,
        offset: usize,
        flags: PeekFlags,
    ) -> Result<Peeked<T>, PacketError> {
        let data_length = self.data_length();
        if offset > data_length {
            return Err(self.out_of_range(offset, 0));
        }
        let start = self.front_offset + offset;
        let end = self.front_offset + data_length;

        // Fast path: a structured chunk of the right type starts here.
        if let Some((idx, 0)) = self.locate(start) {
            let chunk = &self.chunks[idx];
            if let Some(h) = chunk.downcast::<T>() {
                if start + chunk.len() <= end {
                    if !chunk.is_correct() && !flags.allow_incorrect {
                        return Err(PacketError::Incorrect);
                    }
                    return Ok(Peeked {
                        header: h.clone(),
                        correct: chunk.is_correct(),
                        complete: true,
                    });
                }
            }
        }

        let available = self.bytes_between(start, end);
        let (header, complete) = match T::deserialize(&available) {
            Ok(h) => (h, true),
            Err(WireError::Truncated { need, have }) => {
                if !flags.allow_incomplete {
                    return Err(PacketError::Incomplete { need, have });
                }
                let mut padded = available.to_vec();
                padded.resize(need.max(T::MIN_LENGTH), 0);
                (T::deserialize(&padded)?, false)
            }
            Err(e) => return Err(PacketError::Malformed(e)),
        };
        let covered = header.chunk_length().min(end - start);
        let correct = self.range_correct(start, start + covered);
        if !correct && !flags.allow_incorrect {
            return Err(PacketError::Incorrect);
        }
        Ok(Peeked {
            header,
            correct,
            complete,
        })
    }

    pub fn pop_at_front<T: Header>(&mut self) -> Result<T, PacketError> {
        self.pop_at_front_with::<T>(PeekFlags::STRICT)
            .map(|p| p.header)
    }

    pub fn pop_at_front_with<T: Header>(
        &mut self,
        flags: PeekFlags,
    ) -> Result<Peeked<T>, PacketError> {
        let peeked = self.peek_at_with::<T>(0, flags)?;
        let len = peeked.header.chunk_length().min(self.data_length());
        self.front_offset += len;
        Ok(peeked)
    }

    /// Parse the last `length` bytes of the data region as `T` and pop them.
    pub fn pop_at_back<T: Header>(&mut self, length: usize) -> Result<T, PacketError> {
        let data_length = self.data_length();
        if length > data_length {
            return Err(PacketError::Incomplete {
                need: length,
                have: data_length,
            });
        }
        let header = self.peek_at::<T>(data_length - length)?;
        self.back_offset += length;
        Ok(header)
    }

    /// Take the front header out of the packet so it can be modified and
    /// inserted back. The front popped region must be empty.
    pub fn remove_at_front<T: Header>(&mut self) -> Result<T, PacketError> {
        if self.front_offset != 0 {
            return Err(PacketError::PoppedRegionNotEmpty);
        }
        let peeked = self.peek_at_with::<T>(0, PeekFlags::ALLOW_INCORRECT)?;
        let len = peeked.header.chunk_length();
        self.split_at(len);
        let mut removed = 0;
        while removed < len {
            match self.chunks.pop_front() {
                Some(c) => removed += c.len(),
                None => break,
            }
        }
        Ok(peeked.header)
    }

    /// Bytes or structured content at `offset` into the data region. A range
    /// matching a single chunk returns that chunk unchanged.
    pub fn peek_data_at(&self, offset: usize, length: usize) -> Result<Chunk, PacketError> {
        if offset + length > self.data_length() {
            return Err(self.out_of_range(offset, length));
        }
        let start = self.front_offset + offset;
        if let Some((idx, 0)) = self.locate(start) {
            if self.chunks[idx].len() == length {
                return Ok(self.chunks[idx].clone());
            }
        }
        let bytes = self.bytes_between(start, start + length);
        let chunk = Chunk::bytes(bytes);
        Ok(if self.range_correct(start, start + length) {
            chunk
        } else {
            chunk.into_incorrect()
        })
    }

    /// The whole data region as one chunk.
    pub fn peek_data(&self) -> Chunk {
        let start = self.front_offset;
        let end = start + self.data_length();
        if self.chunks.len() == 1 && start == 0 && end == self.total_length() {
            return self.chunks[0].clone();
        }
        let chunk = Chunk::bytes(self.bytes_between(start, end));
        if self.range_correct(start, end) {
            chunk
        } else {
            chunk.into_incorrect()
        }
    }

    /// True if every chunk overlapping the data region is correct.
    pub fn is_data_correct(&self) -> bool {
        let start = self.front_offset;
        self.range_correct(start, start + self.data_length())
    }

    // ── Insert / trim ────────────────────────────────────────────────────────

    pub fn insert_at_front(&mut self, chunk: Chunk) -> Result<(), PacketError> {
        if self.front_offset != 0 {
            return Err(PacketError::PoppedRegionNotEmpty);
        }
        if !chunk.is_empty() {
            self.chunks.push_front(chunk);
        }
        Ok(())
    }

    pub fn insert_at_back(&mut self, chunk: Chunk) -> Result<(), PacketError> {
        if self.back_offset != 0 {
            return Err(PacketError::PoppedRegionNotEmpty);
        }
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
        Ok(())
    }

    /// Discard the popped front region.
    pub fn trim_front(&mut self) {
        let len = self.front_offset;
        self.split_at(len);
        let mut removed = 0;
        while removed < len {
            match self.chunks.pop_front() {
                Some(c) => removed += c.len(),
                None => break,
            }
        }
        self.front_offset = 0;
    }

    /// Discard the popped back region.
    pub fn trim_back(&mut self) {
        let len = self.back_offset;
        let total = self.total_length();
        self.split_at(total - len);
        let mut removed = 0;
        while removed < len {
            match self.chunks.pop_back() {
                Some(c) => removed += c.len(),
                None => break,
            }
        }
        self.back_offset = 0;
    }

    pub fn trim(&mut self) {
        self.trim_front();
        self.trim_back();
    }

    // ── Bytes ────────────────────────────────────────────────────────────────

    /// Every byte of the packet, popped regions included.
    pub fn content_bytes(&self) -> Bytes {
        self.bytes_between(0, self.total_length())
    }

    /// Bytes of the data region.
    pub fn data_bytes(&self) -> Bytes {
        let start = self.front_offset;
        self.bytes_between(start, start + self.data_length())
    }

    /// Independent copy sharing chunk storage.
    pub fn dup(&self) -> Packet {
        self.clone()
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn out_of_range(&self, offset: usize, length: usize) -> PacketError {
        PacketError::OutOfRange {
            offset,
            length,
            data_length: self.data_length(),
        }
    }

    /// Chunk index and offset within that chunk for absolute position `pos`.
    fn locate(&self, pos: usize) -> Option<(usize, usize)> {
        let mut at = 0;
        for (idx, c) in self.chunks.iter().enumerate() {
            let len = c.len();
            if pos < at + len {
                return Some((idx, pos - at));
            }
            at += len;
        }
        None
    }

    fn bytes_between(&self, start: usize, end: usize) -> Bytes {
        if start >= end {
            return Bytes::new();
        }
        let mut pieces: Vec<Bytes> = Vec::new();
        let mut at = 0;
        for c in &self.chunks {
            let (c_start, c_end) = (at, at + c.len());
            at = c_end;
            if c_end <= start || c_start >= end {
                continue;
            }
            let from = start.max(c_start) - c_start;
            let to = end.min(c_end) - c_start;
            pieces.push(c.to_bytes().slice(from..to));
        }
        if pieces.len() == 1 {
            return pieces.swap_remove(0);
        }
        let mut buf = BytesMut::with_capacity(end - start);
        for piece in &pieces {
            buf.extend_from_slice(piece);
        }
        buf.freeze()
    }

    fn range_correct(&self, start: usize, end: usize) -> bool {
        let mut at = 0;
        for c in &self.chunks {
            let (c_start, c_end) = (at, at + c.len());
            at = c_end;
            if c_end <= start || c_start >= end {
                continue;
            }
            if !c.is_correct() {
                return false;
            }
        }
        true
    }

    /// Ensure a chunk boundary at absolute position `pos`.
    fn split_at(&mut self, pos: usize) {
        if let Some((idx, within)) = self.locate(pos) {
            if within == 0 {
                return;
            }
            let chunk = self.chunks[idx].clone();
            let len = chunk.len();
            self.chunks[idx] = chunk.slice(0, within);
            self.chunks.insert(idx + 1, chunk.slice(within, len - within));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FieldsChunk;
    use bytes::BufMut;

    #[derive(Debug, Clone, PartialEq)]
    struct TwoByte(u16);

    impl FieldsChunk for TwoByte {
        fn chunk_length(&self) -> usize {
            2
        }
        fn serialize(&self, out: &mut BytesMut) {
            out.put_u16(self.0);
        }
    }

    impl Header for TwoByte {
        const MIN_LENGTH: usize = 2;
        fn deserialize(bytes: &[u8]) -> Result<Self, WireError> {
            match bytes {
                [a, b, ..] => Ok(TwoByte(u16::from_be_bytes([*a, *b]))),
                _ => Err(WireError::Truncated {
                    need: 2,
                    have: bytes.len(),
                }),
            }
        }
    }

    fn sample() -> Packet {
        let mut p = Packet::with_chunk("p", Chunk::from_slice(&[1, 2, 3, 4, 5, 6]));
        p.insert_at_front(Chunk::fields(TwoByte(0xaabb))).unwrap();
        p
    }

    fn assert_invariant(p: &Packet) {
        assert_eq!(
            p.front_offset() + p.data_length() + p.back_offset(),
            p.total_length()
        );
    }

    #[test]
    fn peek_returns_structured_chunk_without_consuming() {
        let p = sample();
        assert_eq!(p.peek_at_front::<TwoByte>().unwrap(), TwoByte(0xaabb));
        assert_eq!(p.data_length(), 8);
        assert_invariant(&p);
    }

    #[test]
    fn pop_front_and_back_keep_regions_until_trim() {
        let mut p = sample();
        assert_eq!(p.pop_at_front::<TwoByte>().unwrap(), TwoByte(0xaabb));
        assert_eq!(p.pop_at_back::<TwoByte>(2).unwrap(), TwoByte(0x0506));
        assert_eq!(p.front_offset(), 2);
        assert_eq!(p.back_offset(), 2);
        assert_eq!(p.data_bytes().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(p.total_length(), 8);
        assert_invariant(&p);
        p.trim();
        assert_eq!(p.total_length(), 4);
        assert_eq!(p.content_bytes().as_ref(), &[1, 2, 3, 4]);
        assert_invariant(&p);
    }

    #[test]
    fn parse_from_bytes_across_chunks() {
        let mut p = Packet::with_chunk("p", Chunk::from_slice(&[0x12]));
        p.insert_at_back(Chunk::from_slice(&[0x34, 0x56])).unwrap();
        assert_eq!(p.peek_at_front::<TwoByte>().unwrap(), TwoByte(0x1234));
        assert_eq!(p.peek_at::<TwoByte>(1).unwrap(), TwoByte(0x3456));
    }

    #[test]
    fn incomplete_and_incorrect() {
        let p = Packet::with_chunk("p", Chunk::from_slice(&[0x12]));
        assert!(matches!(
            p.peek_at_front::<TwoByte>(),
            Err(PacketError::Incomplete { need: 2, have: 1 })
        ));
        let relaxed = p
            .peek_at_with::<TwoByte>(
                0,
                PeekFlags {
                    allow_incomplete: true,
                    allow_incorrect: false,
                },
            )
            .unwrap();
        assert_eq!(relaxed.header, TwoByte(0x1200));
        assert!(!relaxed.complete);

        let bad = Packet::with_chunk("bad", Chunk::from_slice(&[1, 2]).into_incorrect());
        assert!(matches!(bad.peek_at_front::<TwoByte>(), Err(PacketError::Incorrect)));
        let peeked = bad
            .peek_at_with::<TwoByte>(0, PeekFlags::ALLOW_INCORRECT)
            .unwrap();
        assert!(!peeked.correct);
    }

    #[test]
    fn insert_requires_empty_popped_region() {
        let mut p = sample();
        p.pop_at_front::<TwoByte>().unwrap();
        assert!(matches!(
            p.insert_at_front(Chunk::zeros(1)),
            Err(PacketError::PoppedRegionNotEmpty)
        ));
        p.trim_front();
        p.insert_at_front(Chunk::zeros(1)).unwrap();
        assert_eq!(p.data_length(), 7);
    }

    #[test]
    fn remove_at_front_splits_bytes() {
        let mut p = Packet::with_chunk("p", Chunk::from_slice(&[9, 8, 7, 6]));
        assert_eq!(p.remove_at_front::<TwoByte>().unwrap(), TwoByte(0x0908));
        assert_eq!(p.content_bytes().as_ref(), &[7, 6]);
        p.insert_at_front(Chunk::fields(TwoByte(1))).unwrap();
        assert_eq!(p.content_bytes().as_ref(), &[0, 1, 7, 6]);
    }

    #[test]
    fn peek_data_exact_chunk_is_shared() {
        let p = sample();
        let payload = p.peek_data_at(2, 6).unwrap();
        assert!(!payload.is_fields());
        let header = p.peek_data_at(0, 2).unwrap();
        assert!(header.downcast::<TwoByte>().is_some());
        let mixed = p.peek_data_at(1, 3).unwrap();
        assert_eq!(mixed.to_bytes().as_ref(), &[0xbb, 1, 2]);
        assert!(p.peek_data_at(4, 5).is_err());
    }

    #[test]
    fn set_back_offset_trims_padding() {
        let mut p = sample();
        p.set_back_offset(5).unwrap();
        assert_eq!(p.data_length(), 5);
        assert_eq!(p.back_offset(), 3);
        assert_invariant(&p);
        assert!(p.set_back_offset(9).is_err());
    }

    #[test]
    fn correctness_propagates_through_composition() {
        let mut p = Packet::with_chunk("p", Chunk::from_slice(&[1, 2]));
        p.insert_at_back(Chunk::from_slice(&[3, 4]).into_incorrect())
            .unwrap();
        assert!(!p.peek_data().is_correct());
        assert!(p.peek_data_at(0, 2).unwrap().is_correct());
        assert!(!p.is_data_correct());
    }
}
