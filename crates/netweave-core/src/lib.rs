//! netweave-core — wire format, envelope codec, chunking and configuration.
//! All other netweave crates depend on this one.

pub mod chunk;
pub mod config;
pub mod message;
pub mod wire;

pub use chunk::{Chunker, Reassembled, Reassembler, UserPayload};
pub use config::NetweaveConfig;
pub use message::{Envelope, KnownPeer, Message, TopologyKind};
pub use wire::{ChannelId, MessageCode, PeerId, WireError};
