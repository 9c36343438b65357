//! HTTP tracker announce
//!
//! One `started` announce per tracker URL, tried in metainfo order until one
//! hands back peers. UDP trackers are skipped.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, TorrentError};
use crate::peer::{dedupe_peers, parse_compact_peers, PeerAddress, PeerSource};
use crate::protocol::PeerId;
use crate::torrent::TorrentInfo;

/// Default HTTP timeout for one announce
pub const DEFAULT_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<ByteBuf>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<ByteBuf>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
    #[serde(default)]
    peers6: Option<ByteBuf>,
}

/// Decoded announce response
#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: Option<u64>,
    pub seeders: Option<u64>,
    pub leechers: Option<u64>,
    pub peers: Vec<PeerAddress>,
}

impl AnnounceResponse {
    /// Decode a bencoded tracker response body
    pub fn parse(body: &[u8], url: &str) -> Result<Self> {
        let raw: RawAnnounceResponse = serde_bencode::from_bytes(body)
            .map_err(|e| TorrentError::tracker_error_full("Invalid tracker response", url, e.to_string()))?;

        if let Some(reason) = raw.failure_reason {
            return Err(TorrentError::tracker_error(
                format!("Tracker refused announce: {}", String::from_utf8_lossy(&reason)),
                url,
            ));
        }
        if let Some(warning) = raw.warning_message {
            warn!("Tracker {} warning: {}", url, String::from_utf8_lossy(&warning));
        }

        let mut peers = match raw.peers {
            Some(Value::Bytes(compact)) => {
                if compact.len() % 6 != 0 {
                    warn!("Tracker {} sent {} trailing peer bytes", url, compact.len() % 6);
                }
                parse_compact_peers(&compact, 6, PeerSource::Tracker)
            }
            Some(Value::List(entries)) => entries.iter().filter_map(dictionary_peer).collect(),
            Some(_) => {
                return Err(TorrentError::tracker_error("Unexpected peers field type", url));
            }
            None => Vec::new(),
        };
        if let Some(compact6) = raw.peers6 {
            peers.extend(parse_compact_peers(&compact6, 18, PeerSource::Tracker));
        }

        Ok(Self {
            interval: raw.interval.and_then(|v| u64::try_from(v).ok()),
            seeders: raw.complete.and_then(|v| u64::try_from(v).ok()),
            leechers: raw.incomplete.and_then(|v| u64::try_from(v).ok()),
            peers: dedupe_peers(peers),
        })
    }
}

/// Non-compact `{ip, port}` peer entry
fn dictionary_peer(entry: &Value) -> Option<PeerAddress> {
    let Value::Dict(dict) = entry else { return None };
    let ip = match dict.get(b"ip".as_slice())? {
        Value::Bytes(ip) => std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?,
        _ => return None,
    };
    let port = match dict.get(b"port".as_slice())? {
        Value::Int(port) => u16::try_from(*port).ok().filter(|p| *p != 0)?,
        _ => return None,
    };
    Some(PeerAddress::tcp(SocketAddr::new(ip, port), PeerSource::Tracker))
}

/// HTTP tracker client
#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("swarm-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TorrentError::tracker_error_full("Failed to build HTTP client", "", e.to_string()))?;
        Ok(Self { client })
    }

    /// Build the announce URL with the binary fields percent-encoded by hand
    pub fn announce_url(announce: &str, info: &TorrentInfo, peer_id: &PeerId, port: u16) -> Result<String> {
        let parsed = Url::parse(announce)
            .map_err(|e| TorrentError::tracker_error_full("Invalid tracker URL", announce, e.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(TorrentError::tracker_error(
                format!("Unsupported tracker scheme {}", parsed.scheme()),
                announce,
            ));
        }

        let separator = if parsed.query().is_some() { '&' } else { '?' };
        Ok(format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
            announce,
            separator,
            urlencoding::encode_binary(&info.info_hash),
            urlencoding::encode_binary(peer_id.as_bytes()),
            port,
            info.total_size()
        ))
    }

    /// Announce to a single tracker
    pub async fn announce(&self, announce: &str, info: &TorrentInfo, peer_id: &PeerId, port: u16) -> Result<AnnounceResponse> {
        let url = Self::announce_url(announce, info, peer_id, port)?;
        debug!("Announcing to {}", announce);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Tracker request failed", announce, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TorrentError::tracker_error(format!("Tracker returned HTTP {}", status), announce));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_full("Failed to read tracker response", announce, e.to_string()))?;

        let parsed = AnnounceResponse::parse(&body, announce)?;
        info!(
            "Tracker {} returned {} peers (seeders: {:?}, leechers: {:?})",
            announce,
            parsed.peers.len(),
            parsed.seeders,
            parsed.leechers
        );
        Ok(parsed)
    }

    /// Try every tracker of the torrent in order until one returns peers
    pub async fn announce_all(&self, info: &TorrentInfo, peer_id: &PeerId, port: u16) -> Result<Vec<PeerAddress>> {
        let urls = tracker_urls(info);
        if urls.is_empty() {
            return Err(TorrentError::tracker_error("Torrent lists no trackers", ""));
        }

        let mut last_error = None;
        for url in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                debug!("Skipping non-HTTP tracker {}", url);
                continue;
            }
            match self.announce(&url, info, peer_id, port).await {
                Ok(response) if !response.peers.is_empty() => return Ok(response.peers),
                Ok(_) => debug!("Tracker {} returned no peers", url),
                Err(e) => {
                    warn!("Announce to {} failed: {}", url, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

/// `announce` followed by `announce-list`, without duplicates
pub fn tracker_urls(info: &TorrentInfo) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url in std::iter::once(&info.announce).chain(info.announce_list.iter()) {
        if !url.is_empty() && !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> TorrentInfo {
        let mut info = TorrentInfo::from_content("test.bin", b"0123456789", 4);
        info.announce = "http://tracker.example.com/announce".to_string();
        info.announce_list = vec![
            "udp://tracker.example.org:80".to_string(),
            "http://tracker.example.com/announce".to_string(),
            "https://backup.example.net/announce?key=1".to_string(),
        ];
        info
    }

    #[test]
    fn test_parse_compact_response() {
        let mut body = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
        body.extend_from_slice(b"e");

        let response = AnnounceResponse::parse(&body, "http://t").unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.seeders, Some(5));
        assert_eq!(response.leechers, Some(2));
        let keys: Vec<String> = response.peers.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["10.0.0.1:6881", "10.0.0.2:6882"]);
        assert!(response.peers.iter().all(|p| p.source == PeerSource::Tracker));
    }

    #[test]
    fn test_parse_peers6() {
        let mut body = b"d5:peers0:6:peers618:".to_vec();
        let mut entry = [0u8; 18];
        entry[15] = 1;
        entry[16] = 0x1a;
        entry[17] = 0xe1;
        body.extend_from_slice(&entry);
        body.extend_from_slice(b"e");

        let response = AnnounceResponse::parse(&body, "http://t").unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].key(), "[::1]:6881");
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let body = b"d5:peersld2:ip8:10.0.0.74:porti51413eed2:ip3:bad4:porti1eeee";
        let response = AnnounceResponse::parse(body, "http://t").unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].key(), "10.0.0.7:51413");
    }

    #[test]
    fn test_failure_reason() {
        let body = b"d14:failure reason17:torrent not founde";
        let err = AnnounceResponse::parse(body, "http://t").unwrap_err();
        assert!(matches!(err, TorrentError::TrackerError { .. }));
        assert!(err.to_string().contains("torrent not found"));
    }

    #[test]
    fn test_garbage_response() {
        assert!(AnnounceResponse::parse(b"<html>", "http://t").is_err());
    }

    #[test]
    fn test_announce_url() {
        let info = info();
        let peer_id = PeerId([b'a'; 20]);
        let url = TrackerClient::announce_url(&info.announce, &info, &peer_id, 6881).unwrap();
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash="));
        assert!(url.contains(&format!("&peer_id={}", "a".repeat(20))));
        assert!(url.contains("&port=6881"));
        assert!(url.contains("&left=10"));
        assert!(url.contains("&compact=1"));

        let url = TrackerClient::announce_url(&info.announce_list[2], &info, &peer_id, 6881).unwrap();
        assert!(url.starts_with("https://backup.example.net/announce?key=1&info_hash="));
    }

    #[test]
    fn test_announce_url_rejects_udp() {
        let info = info();
        let err = TrackerClient::announce_url("udp://tracker.example.org:80", &info, &PeerId([0; 20]), 1).unwrap_err();
        assert!(matches!(err, TorrentError::TrackerError { .. }));
    }

    #[test]
    fn test_tracker_urls_in_order_without_duplicates() {
        assert_eq!(
            tracker_urls(&info()),
            vec![
                "http://tracker.example.com/announce",
                "udp://tracker.example.org:80",
                "https://backup.example.net/announce?key=1",
            ]
        );
    }
}
