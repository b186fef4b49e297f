//! meridian-core: packet buffers, tags, protocols, checksums and wire headers.
//! Every other meridian crate depends on this one.

pub mod address;
pub mod checksum;
pub mod chunk;
pub mod config;
pub mod packet;
pub mod protocol;
pub mod tags;
pub mod wire;

pub use address::{InterfaceId, MacAddress, SocketId};
pub use checksum::CrcMode;
pub use chunk::{Chunk, FieldsChunk, Header};
pub use packet::{Packet, PacketError, PeekFlags};
pub use protocol::{Protocol, ProtocolGroup};
pub use tags::TagSet;

/// Simulated time. The event loop owns the clock and passes it in.
pub type SimTime = std::time::Duration;
