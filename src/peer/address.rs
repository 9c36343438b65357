//! Peer address model
//!
//! Network endpoints gathered from trackers, the DHT or the command line.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use tracing::trace;

use crate::error::TorrentError;

/// Transport kind a peer advertised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Utp,
}

/// Where a peer address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Manual,
    Tracker,
    Dht,
}

/// A remote peer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
    pub source: PeerSource,
}

impl PeerAddress {
    /// TCP peer from a socket address
    pub fn tcp(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
            transport: Transport::Tcp,
            source,
        }
    }

    /// IP with IPv4-mapped IPv6 addresses folded back to IPv4
    pub fn normalized_ip(&self) -> IpAddr {
        match self.ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(self.ip),
            v4 => v4,
        }
    }

    /// Socket address to connect to
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.normalized_ip(), self.port)
    }

    /// Normalized `"ip:port"` key, IPv6 bracketed
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for PeerAddress {
    type Err = TorrentError;

    /// Parse a manual `ip:port` peer (IPv6 as `[addr]:port`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.trim().parse().map_err(|_| {
            TorrentError::validation_error_with_field(format!("Invalid peer address '{}'", s), "peer")
        })?;
        if addr.port() == 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("Peer address '{}' has port 0", s),
                "peer",
            ));
        }
        Ok(Self::tcp(addr, PeerSource::Manual))
    }
}

/// Drop duplicate addresses, keeping the first occurrence of each key
pub fn dedupe_peers<I>(peers: I) -> Vec<PeerAddress>
where
    I: IntoIterator<Item = PeerAddress>,
{
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for peer in peers {
        if seen.insert(peer.key()) {
            unique.push(peer);
        } else {
            trace!("Dropping duplicate peer {} from {:?}", peer, peer.source);
        }
    }
    unique
}

/// Decode compact peer entries: 6 bytes per IPv4 peer or 18 bytes per IPv6 peer
pub fn parse_compact_peers(data: &[u8], entry_len: usize, source: PeerSource) -> Vec<PeerAddress> {
    if entry_len != 6 && entry_len != 18 {
        return Vec::new();
    }
    data.chunks_exact(entry_len)
        .map(|chunk| {
            let (ip_bytes, port_bytes) = chunk.split_at(entry_len - 2);
            let ip = if entry_len == 6 {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(ip_bytes);
                IpAddr::from(octets)
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(ip_bytes);
                IpAddr::from(octets)
            };
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            PeerAddress::tcp(SocketAddr::new(ip, port), source)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_key_normalizes_mapped_ipv4() {
        let mapped = Ipv6Addr::from([0, 0, 0, 0, 0, 0xffff, 0x0a00, 0x0001]);
        let peer = PeerAddress::tcp(SocketAddr::new(IpAddr::V6(mapped), 6881), PeerSource::Dht);
        assert_eq!(peer.key(), "10.0.0.1:6881");
    }

    #[test]
    fn test_key_brackets_ipv6() {
        let peer: PeerAddress = "[2001:db8::1]:51413".parse().unwrap();
        assert_eq!(peer.key(), "[2001:db8::1]:51413");
        assert_eq!(peer.source, PeerSource::Manual);
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let a = PeerAddress::tcp("10.0.0.1:6881".parse().unwrap(), PeerSource::Tracker);
        let b = PeerAddress::tcp("10.0.0.1:6881".parse().unwrap(), PeerSource::Dht);
        let c = PeerAddress::tcp("10.0.0.2:6881".parse().unwrap(), PeerSource::Dht);

        let unique = dedupe_peers(vec![a.clone(), b, c.clone()]);
        assert_eq!(unique, vec![a, c]);
    }

    #[test]
    fn test_parse_compact_peers() {
        let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x00, 0x50, 9];
        let peers = parse_compact_peers(&data, 6, PeerSource::Tracker);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].key(), "127.0.0.1:6881");
        assert_eq!(peers[1].key(), "10.0.0.2:80");
    }

    #[test]
    fn test_parse_compact_peers_v6() {
        let mut data = Ipv6Addr::LOCALHOST.octets().to_vec();
        data.extend_from_slice(&[0x1a, 0xe1]);
        let peers = parse_compact_peers(&data, 18, PeerSource::Dht);
        assert_eq!(peers[0].key(), "[::1]:6881");
    }

    #[test]
    fn test_invalid_manual_peer() {
        assert!("not-an-address".parse::<PeerAddress>().is_err());
        assert!("10.0.0.1:0".parse::<PeerAddress>().is_err());
    }
}
