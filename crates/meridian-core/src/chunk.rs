//! Chunks: immutable, reference-counted pieces of packet content.
//!
//! A chunk is either raw bytes or a structured header that serializes
//! lazily. Cloning a chunk never copies bytes. Bit errors are simulated by
//! marking a chunk incorrect; the bytes themselves are left untouched.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};

use crate::wire::WireError;

// ── Structured content ────────────────────────────────────────────────────────

#[doc(hidden)]
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A typed header or trailer that knows its exact wire length and how to
/// write itself. Serialization must be deterministic.
pub trait FieldsChunk: AsAny + fmt::Debug + Send + Sync {
    /// Exact number of bytes `serialize` writes.
    fn chunk_length(&self) -> usize;

    fn serialize(&self, out: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.chunk_length());
        self.serialize(&mut out);
        out.freeze()
    }
}

/// A structured chunk that can also be parsed back from bytes.
pub trait Header: FieldsChunk + Clone + Sized {
    /// Fewest bytes `deserialize` can succeed on.
    const MIN_LENGTH: usize;

    /// Parse from the start of `bytes`. Trailing bytes are ignored; the
    /// consumed length is `chunk_length()` of the result.
    fn deserialize(bytes: &[u8]) -> Result<Self, WireError>;
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Repr {
    Bytes(Bytes),
    Fields {
        fields: Arc<dyn FieldsChunk>,
        cache: Arc<OnceLock<Bytes>>,
    },
}

#[derive(Clone)]
pub struct Chunk {
    repr: Repr,
    correct: bool,
}

impl Chunk {
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            repr: Repr::Bytes(bytes.into()),
            correct: true,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::bytes(Bytes::copy_from_slice(bytes))
    }

    /// Zero-filled payload of `len` bytes.
    pub fn zeros(len: usize) -> Self {
        Self::bytes(Bytes::from(vec![0u8; len]))
    }

    pub fn fields<T: FieldsChunk>(fields: T) -> Self {
        Self {
            repr: Repr::Fields {
                fields: Arc::new(fields),
                cache: Arc::new(OnceLock::new()),
            },
            correct: true,
        }
    }

    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Bytes(b) => b.len(),
            Repr::Fields { fields, .. } => fields.chunk_length(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_correct(&self) -> bool {
        self.correct
    }

    /// Same content, flagged as carrying a bit error.
    pub fn into_incorrect(mut self) -> Self {
        self.correct = false;
        self
    }

    pub fn set_correct(&mut self, correct: bool) {
        self.correct = correct;
    }

    pub fn is_fields(&self) -> bool {
        matches!(self.repr, Repr::Fields { .. })
    }

    /// Serialized content. Structured chunks serialize on first call and
    /// cache the result, shared by every clone.
    pub fn to_bytes(&self) -> Bytes {
        match &self.repr {
            Repr::Bytes(b) => b.clone(),
            Repr::Fields { fields, cache } => cache.get_or_init(|| fields.to_bytes()).clone(),
        }
    }

    /// True once the serialized form has been produced.
    pub fn is_serialized(&self) -> bool {
        match &self.repr {
            Repr::Bytes(_) => true,
            Repr::Fields { cache, .. } => cache.get().is_some(),
        }
    }

    /// Borrow the structured content as `T`, if that is what this chunk holds.
    pub fn downcast<T: FieldsChunk>(&self) -> Option<&T> {
        match &self.repr {
            Repr::Fields { fields, .. } => {
                let any: &dyn Any = AsAny::as_any(fields.as_ref());
                any.downcast_ref::<T>()
            }
            Repr::Bytes(_) => None,
        }
    }

    /// Sub-range as a bytes chunk. Correctness carries over.
    pub fn slice(&self, offset: usize, len: usize) -> Chunk {
        if offset == 0 && len == self.len() {
            return self.clone();
        }
        let bytes = self.to_bytes().slice(offset..offset + len);
        Chunk {
            repr: Repr::Bytes(bytes),
            correct: self.correct,
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.correct { "" } else { " incorrect" };
        match &self.repr {
            Repr::Bytes(b) => write!(f, "Bytes[{}{flag}]", b.len()),
            Repr::Fields { fields, .. } => write!(f, "{fields:?}[{}{flag}]", fields.chunk_length()),
        }
    }
}
