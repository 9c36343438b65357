//! Torrent metadata module
//!
//! Parses .torrent files into the static session description used by the
//! download engine.

pub mod info;
pub mod parser;

pub use info::{sha1_digest, TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
