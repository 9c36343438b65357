//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use bitfield::Bitfield;
pub use handshake::{Handshake, PeerId, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, MAX_MESSAGE_LEN};
