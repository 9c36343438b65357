//! swarm-downloader
//!
//! A concurrent multi-peer BitTorrent downloader with DHT peer discovery.

pub mod cli;
pub mod dht;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod torrent;
#[cfg(feature = "tracker")]
pub mod tracker;

pub use error::{Result, TorrentError};

pub use cli::{CliArgs, Config};
pub use dht::{DhtConfig, DhtDiscovery, DiscoveryResult, SwarmEstimate};
pub use download::{DownloadOutcome, Downloader, PieceDistributor, PieceLedger, PieceStatus};
pub use peer::{dedupe_peers, PeerAddress, PeerConfig, PeerConnection, PeerSource, PeerWorker, Transport};
pub use protocol::{Bitfield, Handshake, Message, MessageId, PeerId};
pub use session::{ManualPeers, PeerProvider, PeerRequest, Session};
pub use storage::{FileLayout, OutputWriter, VerifiedPiece};
pub use torrent::{TorrentInfo, TorrentParser};
#[cfg(feature = "tracker")]
pub use tracker::{AnnounceResponse, TrackerClient};
