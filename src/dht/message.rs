//! DHT message module
//!
//! KRPC queries and responses, bencoded through `serde_bencode::value::Value`.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde_bencode::value::Value;
use tracing::trace;

use crate::dht::node::{parse_compact_nodes, Node, NodeId};
use crate::error::{Result, TorrentError};
use crate::peer::{parse_compact_peers, PeerAddress, PeerSource};

/// Queries we send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }

    /// Encode as a KRPC query datagram
    pub fn encode(&self, transaction_id: &[u8], our_id: &NodeId) -> Result<Vec<u8>> {
        let mut args = HashMap::new();
        args.insert(key("id"), Value::Bytes(our_id.as_bytes().to_vec()));
        match self {
            Query::GetPeers { info_hash } => {
                args.insert(key("info_hash"), Value::Bytes(info_hash.to_vec()));
            }
            Query::AnnouncePeer { info_hash, port, token } => {
                args.insert(key("info_hash"), Value::Bytes(info_hash.to_vec()));
                args.insert(key("port"), Value::Int(*port as i64));
                args.insert(key("implied_port"), Value::Int(0));
                args.insert(key("token"), Value::Bytes(token.clone()));
            }
        }

        let mut message = HashMap::new();
        message.insert(key("t"), Value::Bytes(transaction_id.to_vec()));
        message.insert(key("y"), Value::Bytes(b"q".to_vec()));
        message.insert(key("q"), Value::Bytes(self.method().as_bytes().to_vec()));
        message.insert(key("a"), Value::Dict(args));

        serde_bencode::to_bytes(&Value::Dict(message)).map_err(|e| {
            TorrentError::discovery_error_full("Failed to encode KRPC query", self.method(), e.to_string())
        })
    }
}

/// Fields of a `get_peers` (or any) response we care about
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<Node>,
    pub values: Vec<PeerAddress>,
    pub token: Option<Vec<u8>>,
    /// BEP 33 seed filter
    pub bf_seeds: Option<Vec<u8>>,
    /// BEP 33 peer filter
    pub bf_peers: Option<Vec<u8>>,
}

/// A received KRPC message
#[derive(Debug, Clone)]
pub enum KrpcMessage {
    Response { transaction_id: Vec<u8>, response: Response },
    Error { transaction_id: Vec<u8>, code: i64, message: String },
    /// Incoming query; we do not serve the DHT
    Query { transaction_id: Vec<u8>, method: String },
}

impl KrpcMessage {
    pub fn transaction_id(&self) -> &[u8] {
        match self {
            KrpcMessage::Response { transaction_id, .. }
            | KrpcMessage::Error { transaction_id, .. }
            | KrpcMessage::Query { transaction_id, .. } => transaction_id,
        }
    }

    /// Decode a datagram received from `from`
    pub fn decode(data: &[u8], from: SocketAddr) -> Result<Self> {
        let malformed = |what: &str| TorrentError::discovery_error_full("Malformed KRPC message", from.to_string(), what);

        let value: Value = serde_bencode::from_bytes(data)
            .map_err(|e| TorrentError::discovery_error_full("Undecodable KRPC message", from.to_string(), e.to_string()))?;
        let Value::Dict(dict) = value else {
            return Err(malformed("not a dictionary"));
        };

        let transaction_id = bytes_field(&dict, "t").ok_or_else(|| malformed("missing t"))?.to_vec();
        let kind = bytes_field(&dict, "y").ok_or_else(|| malformed("missing y"))?;
        trace!("KRPC {:?} from {}", String::from_utf8_lossy(kind), from);

        match kind {
            b"r" => {
                let Some(Value::Dict(r)) = dict.get(b"r".as_slice()) else {
                    return Err(malformed("missing r"));
                };
                Ok(KrpcMessage::Response {
                    transaction_id,
                    response: parse_response(r),
                })
            }
            b"e" => {
                let (code, message) = match dict.get(b"e".as_slice()) {
                    Some(Value::List(items)) => {
                        let code = match items.first() {
                            Some(Value::Int(code)) => *code,
                            _ => 0,
                        };
                        let message = match items.get(1) {
                            Some(Value::Bytes(m)) => String::from_utf8_lossy(m).into_owned(),
                            _ => String::new(),
                        };
                        (code, message)
                    }
                    _ => (0, String::new()),
                };
                Ok(KrpcMessage::Error { transaction_id, code, message })
            }
            b"q" => {
                let method = bytes_field(&dict, "q")
                    .map(|m| String::from_utf8_lossy(m).into_owned())
                    .unwrap_or_default();
                Ok(KrpcMessage::Query { transaction_id, method })
            }
            _ => Err(malformed("unknown message type")),
        }
    }
}

fn parse_response(r: &HashMap<Vec<u8>, Value>) -> Response {
    let mut nodes = bytes_field(r, "nodes")
        .map(|data| parse_compact_nodes(data, 26))
        .unwrap_or_default();
    if let Some(data) = bytes_field(r, "nodes6") {
        nodes.extend(parse_compact_nodes(data, 38));
    }

    let values = match r.get(b"values".as_slice()) {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::Bytes(b) if b.len() == 6 || b.len() == 18 => {
                    Some(parse_compact_peers(b, b.len(), PeerSource::Dht))
                }
                _ => None,
            })
            .flatten()
            .collect(),
        _ => Vec::new(),
    };

    Response {
        id: bytes_field(r, "id").and_then(NodeId::from_slice),
        nodes,
        values,
        token: bytes_field(r, "token").map(<[u8]>::to_vec),
        bf_seeds: bytes_field(r, "BFsd").map(<[u8]>::to_vec),
        bf_peers: bytes_field(r, "BFpe").map(<[u8]>::to_vec),
    }
}

fn key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

fn bytes_field<'a>(dict: &'a HashMap<Vec<u8>, Value>, name: &str) -> Option<&'a [u8]> {
    match dict.get(name.as_bytes()) {
        Some(Value::Bytes(b)) => Some(b.as_slice()),
        _ => None,
    }
}
