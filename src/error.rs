//! Error types for the swarm downloader
//!
//! Every component reports failures through [`TorrentError`]. Whether an error
//! stays local to one peer worker or aborts the whole session is decided by
//! [`TorrentError::is_fatal`].

use std::fmt;

/// Result alias used by the library modules
pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

/// Error type for torrent download operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Torrent metadata parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer unreachable, timed out or closed the stream
    ConnectionError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Malformed handshake or message framing
    ProtocolError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Piece content did not match its expected hash
    IntegrityError {
        piece: u32,
        peer: Option<String>,
    },

    /// Piece assignment state is inconsistent
    DistributorInvariant {
        message: String,
        piece: Option<u32>,
    },

    /// Output file creation or write errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// DHT server or traversal setup errors
    DiscoveryError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        url: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ConnectionError with peer address
    pub fn connection_error(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::ConnectionError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new ConnectionError with peer and source
    pub fn connection_error_full(
        message: impl Into<String>,
        peer: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::ConnectionError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            peer: None,
            source: Some(source.into()),
        }
    }

    /// Create a new IntegrityError
    pub fn integrity_error(piece: u32, peer: impl Into<String>) -> Self {
        TorrentError::IntegrityError {
            piece,
            peer: Some(peer.into()),
        }
    }

    /// Create a new DistributorInvariant error
    pub fn invariant_error(message: impl Into<String>, piece: u32) -> Self {
        TorrentError::DistributorInvariant {
            message: message.into(),
            piece: Some(piece),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DiscoveryError
    pub fn discovery_error(message: impl Into<String>) -> Self {
        TorrentError::DiscoveryError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DiscoveryError with node and source
    pub fn discovery_error_full(
        message: impl Into<String>,
        node: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::DiscoveryError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError with url
    pub fn tracker_error(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with url and source
    pub fn tracker_error_full(
        message: impl Into<String>,
        url: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Attach the remote peer to a connection or protocol error
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        match &mut self {
            TorrentError::ConnectionError { peer, .. }
            | TorrentError::ProtocolError { peer, .. }
            | TorrentError::IntegrityError { peer, .. } => {
                *peer = Some(addr.into());
            }
            _ => {}
        }
        self
    }

    /// Fatal errors abort the session; everything else is recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::DistributorInvariant { .. } | TorrentError::StorageError { .. }
        )
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ConnectionError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Connection error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Connection error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Connection error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Connection error: {}", message),
                }
            }
            TorrentError::ProtocolError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Protocol error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Protocol error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Protocol error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Protocol error: {}", message),
                }
            }
            TorrentError::IntegrityError { piece, peer } => {
                if let Some(p) = peer {
                    write!(f, "Integrity error: piece {} failed hash check (peer: {})", piece, p)
                } else {
                    write!(f, "Integrity error: piece {} failed hash check", piece)
                }
            }
            TorrentError::DistributorInvariant { message, piece } => {
                if let Some(index) = piece {
                    write!(f, "Distributor invariant violated: {} (piece: {})", message, index)
                } else {
                    write!(f, "Distributor invariant violated: {}", message)
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::DiscoveryError { message, node, source } => {
                match (node, source) {
                    (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                    (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                    (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                    (None, None) => write!(f, "DHT error: {}", message),
                }
            }
            TorrentError::TrackerError { message, url, source } => {
                match (url, source) {
                    (Some(u), Some(s)) => write!(f, "Tracker error: {} (url: {}, source: {})", message, u, s),
                    (Some(u), None) => write!(f, "Tracker error: {} (url: {})", message, u),
                    (None, Some(s)) => write!(f, "Tracker error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Tracker error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}
