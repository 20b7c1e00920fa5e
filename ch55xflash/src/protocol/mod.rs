//! Protocol implementations.

pub mod checksum;
pub mod frame;
pub mod link;
pub mod version;

// Re-export common types
pub use checksum::{Bootkey, sum8};
pub use frame::{Command, Frame, Reply, decode, encode, hex};
pub use version::{ChunkKind, ProtocolVersion, TransportKind};
