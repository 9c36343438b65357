//! DHT (Distributed Hash Table) module
//!
//! Client-side Mainline DHT lookup used for peer discovery. We query the
//! DHT but never answer queries or keep a routing table across runs.

pub mod bloom;
pub mod message;
pub mod node;
pub mod traversal;

pub use bloom::estimate_count;
pub use message::{KrpcMessage, Query, Response};
pub use node::{encode_compact_nodes, parse_compact_nodes, Node, NodeId};
pub use traversal::{DhtConfig, DhtDiscovery, DiscoveryResult, SwarmEstimate, DEFAULT_BOOTSTRAP_NODES, K};
