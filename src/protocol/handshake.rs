//! BitTorrent handshake protocol
//!
//! Handles the initial fixed-layout greeting between peers.

use std::fmt;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TorrentError};

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total length of a serialized handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix used in generated peer ids (Azureus style)
const PEER_ID_PREFIX: &[u8; 8] = b"-SD0100-";

/// Our own 20-byte peer identifier, generated once per session
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a random peer id with the client prefix
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        let peer_id = Self(id);
        info!("Generated peer ID: {}", peer_id);
        peer_id
    }

    /// Raw bytes of the id
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bits
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id: peer_id.0,
        }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        trace!("Handshake serialized: {} bytes", buf.len());
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly [`HANDSHAKE_LEN`] bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_error_with_source(
                "Malformed handshake",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ));
        }

        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            ));
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol_error("Invalid protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!("Handshake from peer_id {}", hex::encode(peer_id));
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check that the remote greeting is for the torrent we expect
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(TorrentError::protocol_error_with_source(
                "Handshake info hash mismatch",
                hex::encode(self.info_hash),
            ));
        }
        Ok(())
    }
}
