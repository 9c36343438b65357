//! Peer module
//!
//! Peer addresses, the per-peer wire state machine and the download worker.

pub mod address;
pub mod connection;
pub mod worker;

pub use address::{dedupe_peers, parse_compact_peers, PeerAddress, PeerSource, Transport};
pub use connection::{Availability, ConnectionState, PeerConfig, PeerConnection, MAX_BLOCK_SIZE};
pub use worker::PeerWorker;
