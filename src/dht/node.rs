//! DHT node module
//!
//! Node identifiers and the XOR metric.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::Rng;

/// DHT node identifier (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    /// Create a new NodeId from bytes
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a random NodeId
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    /// Parse a NodeId from a byte slice of exactly 20 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    /// Get the NodeId as bytes
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Get the NodeId as a hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another id; compares lexicographically
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut distance = [0u8; 20];
        for (d, (a, b)) in distance.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *d = a ^ b;
        }
        distance
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// A DHT node learned from a `nodes` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Parse compact node info: 26 bytes per IPv4 node, 38 bytes per IPv6 node.
///
/// Trailing partial entries are ignored.
pub fn parse_compact_nodes(data: &[u8], entry_len: usize) -> Vec<Node> {
    if entry_len != 26 && entry_len != 38 {
        return Vec::new();
    }
    data.chunks_exact(entry_len)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..20])?;
            let (ip_bytes, port_bytes) = chunk[20..].split_at(entry_len - 22);
            let ip = if entry_len == 26 {
                IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(ip_bytes).ok()?))
            } else {
                IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(ip_bytes).ok()?))
            };
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            if port == 0 {
                return None;
            }
            Some(Node::new(id, SocketAddr::new(ip, port)))
        })
        .collect()
}

/// Encode nodes in compact IPv4 form; IPv6 nodes are skipped
pub fn encode_compact_nodes(nodes: &[Node]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(nodes.len() * 26);
    for node in nodes {
        if let SocketAddr::V4(v4) = node.addr {
            buffer.extend_from_slice(node.id.as_bytes());
            buffer.extend_from_slice(&v4.ip().octets());
            buffer.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    buffer
}
