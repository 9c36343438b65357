//! Torrent information structures
//!
//! The static description of a download session: identifying hash, piece
//! hashes and the file layout.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::error::{Result, TorrentError};

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

impl TorrentFile {
    /// Relative path of this file below the torrent directory
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// Static torrent information, shared read-only for a whole session
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// All tracker announce URLs, primary first
    pub announce_list: Vec<String>,
    /// SHA1 hash of info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Total content length in bytes
    pub length: u64,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Build a single-file session description
    pub fn single_file(
        name: impl Into<String>,
        info_hash: [u8; 20],
        piece_length: u64,
        pieces: Vec<[u8; 20]>,
        length: u64,
    ) -> Self {
        Self {
            announce: String::new(),
            announce_list: Vec::new(),
            info_hash,
            piece_length,
            pieces,
            name: name.into(),
            length,
            files: None,
        }
    }

    /// Build a session description directly from content bytes.
    ///
    /// Mostly useful for tests and local seeding setups where the payload is
    /// already known.
    pub fn from_content(name: impl Into<String>, content: &[u8], piece_length: u64) -> Self {
        let pieces = content
            .chunks(piece_length.max(1) as usize)
            .map(sha1_digest)
            .collect::<Vec<_>>();
        let info_hash = sha1_digest(&pieces.concat());
        Self::single_file(name, info_hash, piece_length, pieces, content.len() as u64)
    }

    /// Total content length in bytes
    pub fn total_size(&self) -> u64 {
        self.length
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Length of a piece; only the final piece may be shorter
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.length);

        Some((start, end))
    }

    /// Check the session invariants
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::validation_error_with_field(
                "piece length must be positive",
                "piece_length",
            ));
        }

        if let Some(files) = &self.files {
            let sum: u64 = files.iter().map(|f| f.length).sum();
            if sum != self.length {
                return Err(TorrentError::validation_error_with_field(
                    format!("file lengths sum to {} but total length is {}", sum, self.length),
                    "files",
                ));
            }
        }

        let expected = self.length.div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!("expected {} piece hashes, found {}", expected, self.pieces.len()),
                "pieces",
            ));
        }

        Ok(())
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )));
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

/// SHA1 of a byte slice
pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_file_info() -> TorrentInfo {
        TorrentInfo {
            announce: "http://tracker.example.com".to_string(),
            announce_list: vec![],
            info_hash: [1u8; 20],
            piece_length: 80,
            pieces: vec![[0u8; 20]; 5],
            name: "bundle".to_string(),
            length: 350,
            files: Some(vec![
                TorrentFile { path: vec!["a".to_string()], length: 100 },
                TorrentFile { path: vec!["b".to_string()], length: 50 },
                TorrentFile { path: vec!["sub".to_string(), "c".to_string()], length: 200 },
            ]),
        }
    }

    #[test]
    fn test_validate_multi_file() {
        let info = multi_file_info();
        assert!(info.validate().is_ok());
        assert!(info.is_multi_file());
        assert_eq!(info.piece_size(4), Some(30));
    }

    #[test]
    fn test_validate_rejects_length_mismatch() {
        let mut info = multi_file_info();
        info.length = 351;
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_piece_count_mismatch() {
        let mut info = multi_file_info();
        info.pieces.pop();
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_from_content() {
        let info = TorrentInfo::from_content("data.bin", b"0123456789", 4);
        assert_eq!(info.piece_count(), 3);
        assert_eq!(info.piece_size(2), Some(2));
        assert_eq!(info.piece_hash(0), Some(sha1_digest(b"0123")));
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_relative_path() {
        let file = TorrentFile { path: vec!["sub".to_string(), "c".to_string()], length: 1 };
        assert_eq!(file.relative_path(), PathBuf::from("sub").join("c"));
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        let hashes = vec![1u8; 21];
        assert!(TorrentInfo::parse_piece_hashes(&hashes).is_err());
    }

    #[test]
    fn test_piece_range() {
        let info = TorrentInfo::single_file("test", [1u8; 20], 1024, vec![[2u8; 20], [3u8; 20]], 1500);

        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
    }
}
