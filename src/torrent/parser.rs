//! Torrent file parser
//!
//! Decodes `.torrent` metainfo into a [`TorrentInfo`].

use std::path::Path;

use serde::Deserialize;
use serde_bytes::ByteBuf;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TorrentError};
use crate::torrent::info::{sha1_digest, TorrentFile, TorrentInfo};

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    #[serde(default)]
    announce: Option<String>,
    #[serde(rename = "announce-list", default)]
    announce_list: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u64,
    pieces: ByteBuf,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: u64,
    path: Vec<String>,
}

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());

        let info_bytes = raw_info_slice(data)?;
        let info_hash = sha1_digest(info_bytes);
        debug!("Info hash: {}", hex::encode(info_hash));

        let meta: RawMetainfo = serde_bencode::from_bytes(data)?;
        let raw: RawInfo = serde_bencode::from_bytes(info_bytes)?;
        trace!("Raw info: name={}, piece_length={}", raw.name, raw.piece_length);

        let pieces = TorrentInfo::parse_piece_hashes(&raw.pieces)?;
        validate_component(&raw.name)?;

        let (length, files) = match (raw.length, raw.files) {
            (_, Some(raw_files)) if !raw_files.is_empty() => {
                let mut files = Vec::with_capacity(raw_files.len());
                for file in raw_files {
                    if file.path.is_empty() {
                        return Err(TorrentError::parse_error("File entry with empty path"));
                    }
                    for component in &file.path {
                        validate_component(component)?;
                    }
                    files.push(TorrentFile { path: file.path, length: file.length });
                }
                let total = files.iter().map(|f| f.length).sum();
                (total, Some(files))
            }
            (Some(length), _) => (length, None),
            (None, _) => {
                error!("Torrent has neither length nor files");
                return Err(TorrentError::parse_error("Missing length and files fields"));
            }
        };

        let announce = meta.announce.unwrap_or_default();
        let mut announce_list = Vec::new();
        if !announce.is_empty() {
            announce_list.push(announce.clone());
        }
        for url in meta.announce_list.into_iter().flatten().flatten() {
            if !announce_list.contains(&url) {
                announce_list.push(url);
            }
        }
        if announce_list.is_empty() {
            warn!("Torrent lists no trackers");
        }

        let info = TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length: raw.piece_length,
            pieces,
            name: raw.name,
            length,
            files,
        };
        info.validate()?;

        info!(
            "Parsed torrent '{}': {} bytes, {} pieces",
            info.name,
            info.length,
            info.piece_count()
        );
        Ok(info)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source(
                format!("Failed to read torrent file {}", path.display()),
                e.to_string(),
            )
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }
}

/// The `info` value exactly as it appears in `data`; the info hash covers these bytes
fn raw_info_slice(data: &[u8]) -> Result<&[u8]> {
    if data.first() != Some(&b'd') {
        return Err(TorrentError::parse_error("Root must be a dictionary"));
    }
    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (key, value_start) = read_string(data, pos)?;
        let value_end = skip_value(data, value_start)?;
        if key == b"info" {
            if data[value_start] != b'd' {
                return Err(TorrentError::parse_error("Info must be a dictionary"));
            }
            return Ok(&data[value_start..value_end]);
        }
        pos = value_end;
    }
    Err(TorrentError::parse_error("Missing info dictionary"))
}

/// Read a `<len>:<bytes>` string at `pos`; returns it and the position after it
fn read_string(data: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let colon = data[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|offset| pos + offset)
        .ok_or_else(|| TorrentError::parse_error("Unterminated string length"))?;
    let len: usize = std::str::from_utf8(&data[pos..colon])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| TorrentError::parse_error("Invalid string length"))?;
    let end = colon
        .checked_add(1 + len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| TorrentError::parse_error("String runs past end of data"))?;
    Ok((&data[colon + 1..end], end))
}

/// Position just past the bencoded value starting at `pos`
fn skip_value(data: &[u8], pos: usize) -> Result<usize> {
    match data.get(pos) {
        Some(b'i') => data[pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|offset| pos + offset + 1)
            .ok_or_else(|| TorrentError::parse_error("Unterminated integer")),
        Some(b'l') | Some(b'd') => {
            let is_dict = data[pos] == b'd';
            let mut cursor = pos + 1;
            loop {
                match data.get(cursor) {
                    Some(b'e') => return Ok(cursor + 1),
                    Some(_) => {
                        if is_dict {
                            cursor = read_string(data, cursor)?.1;
                        }
                        cursor = skip_value(data, cursor)?;
                    }
                    None => return Err(TorrentError::parse_error("Unterminated list or dictionary")),
                }
            }
        }
        Some(b'0'..=b'9') => Ok(read_string(data, pos)?.1),
        _ => Err(TorrentError::parse_error("Invalid bencode value")),
    }
}

/// Reject path components that would escape the output directory
fn validate_component(component: &str) -> Result<()> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0');
    if bad {
        error!("Unsafe path component in torrent: {:?}", component);
        return Err(TorrentError::parse_error_with_source(
            "Unsafe path component",
            component.to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bencode::value::Value;
    use std::collections::HashMap;

    fn bytes(s: &[u8]) -> Value {
        Value::Bytes(s.to_vec())
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect::<HashMap<_, _>>())
    }

    fn encode(value: &Value) -> Vec<u8> {
        serde_bencode::to_bytes(value).unwrap()
    }

    #[test]
    fn test_parse_single_file() {
        let info = dict(vec![
            ("name", bytes(b"data.bin")),
            ("piece length", Value::Int(4)),
            ("pieces", bytes(&[7u8; 60])),
            ("length", Value::Int(10)),
        ]);
        let expected_hash = sha1_digest(&encode(&info));
        let root = dict(vec![
            ("announce", bytes(b"http://tracker.example.com/announce")),
            ("info", info),
        ]);

        let parsed = TorrentParser::parse_bytes(&encode(&root)).unwrap();
        assert_eq!(parsed.name, "data.bin");
        assert_eq!(parsed.length, 10);
        assert_eq!(parsed.piece_count(), 3);
        assert_eq!(parsed.info_hash, expected_hash);
        assert_eq!(parsed.announce_list, vec!["http://tracker.example.com/announce".to_string()]);
        assert!(!parsed.is_multi_file());
    }

    #[test]
    fn test_info_hash_covers_raw_bytes() {
        // Keys out of canonical order must be hashed as written
        let pieces = [3u8; 20];
        let mut raw_info = b"d4:name8:data.bin6:lengthi10e12:piece lengthi16e6:pieces20:".to_vec();
        raw_info.extend_from_slice(&pieces);
        raw_info.push(b'e');
        let mut data = b"d8:announce4:http4:info".to_vec();
        data.extend_from_slice(&raw_info);
        data.push(b'e');

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.info_hash, sha1_digest(&raw_info));
        assert_eq!(parsed.name, "data.bin");
        assert_eq!(parsed.length, 10);
    }

    #[test]
    fn test_raw_info_slice_skips_nested_values() {
        let data = b"d1:ald1:xi1eee1:ci-5e4:infod1:k3:vale1:z0:e";
        assert_eq!(raw_info_slice(data).unwrap(), b"d1:k3:vale");
        assert!(raw_info_slice(b"d1:ai1ee").is_err());
        assert!(raw_info_slice(b"d4:info5:abce").is_err());
    }

    #[test]
    fn test_parse_multi_file_with_announce_list() {
        let file = |name: &str, len: i64| {
            dict(vec![
                ("length", Value::Int(len)),
                ("path", Value::List(vec![bytes(b"dir"), bytes(name.as_bytes())])),
            ])
        };
        let info = dict(vec![
            ("name", bytes(b"bundle")),
            ("piece length", Value::Int(80)),
            ("pieces", bytes(&[1u8; 100])),
            ("files", Value::List(vec![file("a", 100), file("b", 50), file("c", 200)])),
        ]);
        let root = dict(vec![
            ("announce", bytes(b"http://one/announce")),
            (
                "announce-list",
                Value::List(vec![
                    Value::List(vec![bytes(b"http://one/announce")]),
                    Value::List(vec![bytes(b"udp://two:80")]),
                ]),
            ),
            ("info", info),
        ]);

        let parsed = TorrentParser::parse_bytes(&encode(&root)).unwrap();
        assert_eq!(parsed.length, 350);
        assert_eq!(parsed.piece_count(), 5);
        let files = parsed.files.as_ref().unwrap();
        assert_eq!(files[2].path, vec!["dir".to_string(), "c".to_string()]);
        assert_eq!(parsed.announce_list.len(), 2);
    }

    #[test]
    fn test_parse_rejects_parent_dir_component() {
        let info = dict(vec![
            ("name", bytes(b"bundle")),
            ("piece length", Value::Int(16)),
            ("pieces", bytes(&[1u8; 20])),
            (
                "files",
                Value::List(vec![dict(vec![
                    ("length", Value::Int(10)),
                    ("path", Value::List(vec![bytes(b".."), bytes(b"evil")])),
                ])]),
            ),
        ]);
        let root = dict(vec![("info", info)]);
        assert!(TorrentParser::parse_bytes(&encode(&root)).is_err());
    }

    #[test]
    fn test_parse_missing_info() {
        let root = dict(vec![("announce", bytes(b"http://x"))]);
        assert!(TorrentParser::parse_bytes(&encode(&root)).is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(TorrentParser::parse_bytes(b"not bencode").is_err());
    }
}
