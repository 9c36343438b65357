//! Peer connection module
//!
//! Wire-protocol state machine for one remote peer: connect, handshake,
//! availability exchange and sequential block download.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TorrentError};
use crate::protocol::{BitTorrentWire, Bitfield, Handshake, Message, PeerId};

/// Largest block we request
pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Handshake write+read timeout
    pub handshake_timeout: Duration,
    /// Timeout for each message read, also the longest we stay choked
    pub read_timeout: Duration,
    /// Bytes per block request
    pub block_size: u32,
    /// Hash mismatches tolerated on one connection before closing it
    pub max_hash_failures: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            block_size: MAX_BLOCK_SIZE,
            max_hash_failures: 3,
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(TorrentError::config_error_with_field(
                format!("block size must be between 1 and {}", MAX_BLOCK_SIZE),
                "block_size",
            ));
        }
        if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("timeouts must be positive", "timeout"));
        }
        if self.max_hash_failures == 0 {
            return Err(TorrentError::config_error_with_field(
                "max hash failures must be at least 1",
                "max_hash_failures",
            ));
        }
        Ok(())
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    RequestingPiece,
    Closed,
}

/// Pieces the remote peer claims to hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// The peer sent no bitfield
    Unknown,
    Known(Bitfield),
}

impl Availability {
    /// Whether a piece may be requested from this peer.
    ///
    /// Unknown availability and an empty bitfield both allow any piece.
    pub fn may_have(&self, index: usize) -> bool {
        match self {
            Availability::Unknown => true,
            Availability::Known(field) => field.is_empty() || field.has_piece(index),
        }
    }
}

/// A connected peer
pub struct PeerConnection {
    addr: SocketAddr,
    stream: TcpStream,
    wire: BitTorrentWire,
    config: PeerConfig,
    piece_count: usize,
    state: ConnectionState,
    handshake_completed: bool,
    remote_peer_id: Option<[u8; 20]>,
    availability: Availability,
    peer_choking: bool,
    am_interested: bool,
}

impl PeerConnection {
    /// Open the TCP stream
    pub async fn connect(addr: SocketAddr, piece_count: usize, config: PeerConfig) -> Result<Self> {
        debug!("Connecting to peer: {}", addr);

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("Connection timeout to {}", addr);
                TorrentError::connection_error("Connection timeout", addr.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::connection_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        Ok(Self::from_stream(addr, stream, piece_count, config))
    }

    /// Wrap an already-connected stream
    pub fn from_stream(addr: SocketAddr, stream: TcpStream, piece_count: usize, config: PeerConfig) -> Self {
        Self {
            addr,
            stream,
            wire: BitTorrentWire::new(addr.to_string()),
            config,
            piece_count,
            state: ConnectionState::Handshaking,
            handshake_completed: false,
            remote_peer_id: None,
            availability: Availability::Unknown,
            peer_choking: true,
            am_interested: false,
        }
    }

    /// Connect, handshake, read availability and declare interest
    pub async fn establish(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: PeerId,
        piece_count: usize,
        config: PeerConfig,
    ) -> Result<Self> {
        let mut connection = Self::connect(addr, piece_count, config).await?;
        connection.handshake(info_hash, peer_id).await?;
        connection.read_availability().await?;
        connection.send_interested().await?;
        info!(
            "Peer {} ready ({})",
            addr,
            match &connection.availability {
                Availability::Unknown => "availability unknown".to_string(),
                Availability::Known(field) => format!("{} pieces", field.count()),
            }
        );
        Ok(connection)
    }

    /// Exchange handshakes and check the info hash
    pub async fn handshake(&mut self, info_hash: [u8; 20], peer_id: PeerId) -> Result<()> {
        self.state = ConnectionState::Handshaking;
        let addr = self.addr;
        let ours = Handshake::new(info_hash, peer_id);

        let theirs = timeout(self.config.handshake_timeout, async {
            self.wire.write_handshake(&mut self.stream, &ours).await?;
            self.wire.read_handshake(&mut self.stream).await
        })
        .await
        .map_err(|_| TorrentError::connection_error("Handshake timeout", addr.to_string()))??;

        theirs.validate(&info_hash).map_err(|e| e.with_peer(addr.to_string()))?;

        self.remote_peer_id = Some(theirs.peer_id);
        self.handshake_completed = true;
        self.state = ConnectionState::AwaitingBitfield;
        debug!("Handshake completed with {}", self.addr);
        Ok(())
    }

    /// Read the first message and record what the peer holds
    pub async fn read_availability(&mut self) -> Result<()> {
        let first = self.receive_message().await?;
        match first {
            Message::Bitfield { bitfield } => {
                let field = Bitfield::from_payload(&bitfield, self.piece_count)
                    .map_err(|e| e.with_peer(self.addr.to_string()))?;
                trace!("Peer {} bitfield: {} pieces", self.addr, field.count());
                self.availability = Availability::Known(field);
            }
            other => {
                debug!("Peer {} sent no bitfield, availability unknown", self.addr);
                self.availability = Availability::Unknown;
                self.apply(other)?;
            }
        }
        self.state = ConnectionState::Ready;
        Ok(())
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.send_message(&Message::Interested).await?;
        self.am_interested = true;
        Ok(())
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        if !self.handshake_completed {
            return Err(TorrentError::connection_error(
                "Cannot send message: handshake not completed",
                self.addr.to_string(),
            ));
        }
        trace!("Sending {:?} to {}", message.message_id(), self.addr);
        self.wire.write_message(&mut self.stream, message).await
    }

    /// Receive a message, bounded by the read timeout
    pub async fn receive_message(&mut self) -> Result<Message> {
        let addr = self.addr;
        let message = timeout(self.config.read_timeout, self.wire.read_message(&mut self.stream))
            .await
            .map_err(|_| TorrentError::connection_error("Receive message timeout", addr.to_string()))??;
        trace!("Received {:?} from {}", message.message_id(), addr);
        Ok(message)
    }

    /// Receive a message that must arrive before `deadline`
    async fn receive_before(&mut self, deadline: Instant, index: u32, offset: u32) -> Result<Message> {
        let addr = self.addr;
        let message = timeout_at(deadline, self.wire.read_message(&mut self.stream))
            .await
            .map_err(|_| {
                debug!("Peer {} did not deliver block {}:{} in time", addr, index, offset);
                TorrentError::connection_error_full(
                    "Block request timed out",
                    addr.to_string(),
                    format!("piece {} offset {}", index, offset),
                )
            })??;
        trace!("Received {:?} from {}", message.message_id(), addr);
        Ok(message)
    }

    /// Update connection state from a message that is not a requested block
    pub fn apply(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Choke => {
                debug!("Peer {} choked us", self.addr);
                self.peer_choking = true;
            }
            Message::Unchoke => {
                debug!("Peer {} unchoked us", self.addr);
                self.peer_choking = false;
            }
            Message::Have { piece_index } => {
                if let Availability::Known(field) = &mut self.availability {
                    field.set_piece(piece_index as usize);
                }
            }
            Message::Bitfield { bitfield } => {
                warn!("Peer {} sent a late bitfield", self.addr);
                let field = Bitfield::from_payload(&bitfield, self.piece_count)
                    .map_err(|e| e.with_peer(self.addr.to_string()))?;
                self.availability = Availability::Known(field);
            }
            Message::Piece { index, begin, .. } => {
                debug!("Ignoring unrequested block {}:{} from {}", index, begin, self.addr);
            }
            Message::KeepAlive
            | Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. }
            | Message::Port { .. } => {}
        }
        Ok(())
    }

    /// Read messages until the peer unchokes us, for at most the read timeout
    pub async fn wait_unchoked(&mut self) -> Result<()> {
        if !self.peer_choking {
            return Ok(());
        }
        let addr = self.addr;
        let read_timeout = self.config.read_timeout;
        timeout(read_timeout, async {
            while self.peer_choking {
                let message = self.wire.read_message(&mut self.stream).await?;
                self.apply(message)?;
            }
            Ok::<_, TorrentError>(())
        })
        .await
        .map_err(|_| {
            debug!("Peer {} kept us choked for {:?}", addr, read_timeout);
            TorrentError::connection_error("Peer kept us choked", addr.to_string())
        })?
    }

    /// Download one piece with sequential block requests
    pub async fn download_piece(&mut self, index: u32, length: u32) -> Result<Bytes> {
        self.state = ConnectionState::RequestingPiece;
        let mut buffer = BytesMut::with_capacity(length as usize);
        let mut offset = 0u32;

        'blocks: while offset < length {
            let block_len = self.config.block_size.min(length - offset);
            self.wait_unchoked().await?;
            self.send_message(&Message::Request {
                index,
                begin: offset,
                length: block_len,
            })
            .await?;

            // Chatter from the peer does not extend the wait for the block
            let deadline = Instant::now() + self.config.read_timeout;
            loop {
                match self.receive_before(deadline, index, offset).await? {
                    Message::Piece { index: i, begin, block } if i == index && begin == offset => {
                        if block.len() != block_len as usize {
                            return Err(TorrentError::protocol_error_with_source(
                                "Block has wrong length",
                                format!("piece {} offset {}: expected {}, got {}", index, offset, block_len, block.len()),
                            )
                            .with_peer(self.addr.to_string()));
                        }
                        buffer.extend_from_slice(&block);
                        offset += block_len;
                        continue 'blocks;
                    }
                    Message::Choke => {
                        // Outstanding requests are discarded on choke; re-request after unchoke.
                        self.apply(Message::Choke)?;
                        continue 'blocks;
                    }
                    other => self.apply(other)?,
                }
            }
        }

        self.state = ConnectionState::Ready;
        trace!("Downloaded piece {} ({} bytes) from {}", index, length, self.addr);
        Ok(buffer.freeze())
    }

    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        debug!("Closed connection to {}", self.addr);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn remote_peer_id(&self) -> Option<&[u8; 20]> {
        self.remote_peer_id.as_ref()
    }

    pub fn is_choked(&self) -> bool {
        self.peer_choking
    }

    pub fn is_interested(&self) -> bool {
        self.am_interested
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [5u8; 20];

    async fn accept_and_greet(listener: &TcpListener) -> (TcpStream, BitTorrentWire) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let wire = BitTorrentWire::new("seeder");
        wire.read_handshake(&mut stream).await.unwrap();
        wire.write_handshake(&mut stream, &Handshake::new(INFO_HASH, PeerId([8u8; 20])))
            .await
            .unwrap();
        (stream, wire)
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            read_timeout: Duration::from_millis(500),
            block_size: 4,
            ..PeerConfig::default()
        }
    }

    #[test]
    fn test_availability_may_have() {
        let mut field = Bitfield::new(4);
        assert!(Availability::Known(field.clone()).may_have(2));
        field.set_piece(1);
        let known = Availability::Known(field);
        assert!(known.may_have(1));
        assert!(!known.may_have(2));
        assert!(Availability::Unknown.may_have(3));
    }

    #[test]
    fn test_peer_config_validate() {
        assert!(PeerConfig::default().validate().is_ok());
        let config = PeerConfig { block_size: 32 * 1024, ..PeerConfig::default() };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_download_piece_in_blocks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seeder = tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::Bitfield { bitfield: Bytes::from_static(&[0x80]) })
                .await
                .unwrap();
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            let content = b"abcdefghij";
            loop {
                match wire.read_message(&mut stream).await {
                    Ok(Message::Request { index, begin, length }) => {
                        let block = Bytes::copy_from_slice(&content[begin as usize..(begin + length) as usize]);
                        wire.write_message(&mut stream, &Message::Piece { index, begin, block })
                            .await
                            .unwrap();
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        let mut conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, fast_config())
            .await
            .unwrap();
        assert_eq!(conn.remote_peer_id(), Some(&[8u8; 20]));
        assert!(conn.availability().may_have(0));
        assert!(conn.is_interested());

        let data = conn.download_piece(0, 10).await.unwrap();
        assert_eq!(&data[..], b"abcdefghij");
        assert_eq!(conn.state(), ConnectionState::Ready);
        drop(conn);
        seeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_alives_do_not_extend_block_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            // Never answer requests, just keep the connection chatty
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if wire.write_message(&mut stream, &Message::KeepAlive).await.is_err() {
                    break;
                }
            }
        });

        let config = PeerConfig {
            read_timeout: Duration::from_millis(300),
            ..fast_config()
        };
        let mut conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, config)
            .await
            .unwrap();
        let err = timeout(Duration::from_secs(3), conn.download_piece(0, 4))
            .await
            .expect("block wait must be bounded")
            .unwrap_err();
        assert!(matches!(err, TorrentError::ConnectionError { .. }));
    }

    #[tokio::test]
    async fn test_establish_does_not_unchoke_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let seeder = tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            wire.read_message(&mut stream).await.unwrap()
        });

        let conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, fast_config())
            .await
            .unwrap();
        assert_eq!(seeder.await.unwrap(), Message::Interested);
        drop(conn);
    }

    #[tokio::test]
    async fn test_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let wire = BitTorrentWire::new("seeder");
            let _ = wire.read_handshake(&mut stream).await;
            let _ = wire
                .write_handshake(&mut stream, &Handshake::new([6u8; 20], PeerId([8u8; 20])))
                .await;
        });

        let err = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, fast_config())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TorrentError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn test_no_bitfield_means_unknown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            let _ = wire.read_message(&mut stream).await;
        });

        let conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 3, fast_config())
            .await
            .unwrap();
        assert_eq!(conn.availability(), &Availability::Unknown);
        assert!(!conn.is_choked());
    }

    #[tokio::test]
    async fn test_wrong_block_length_is_protocol_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            while let Ok(message) = wire.read_message(&mut stream).await {
                if let Message::Request { index, begin, .. } = message {
                    let block = Bytes::from_static(b"xy");
                    let _ = wire.write_message(&mut stream, &Message::Piece { index, begin, block }).await;
                }
            }
        });

        let mut conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, fast_config())
            .await
            .unwrap();
        let err = conn.download_piece(0, 4).await.unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn test_choked_too_long() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, wire) = accept_and_greet(&listener).await;
            wire.write_message(&mut stream, &Message::KeepAlive).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(stream);
        });

        let config = PeerConfig { read_timeout: Duration::from_millis(100), ..fast_config() };
        let mut conn = PeerConnection::establish(addr, INFO_HASH, PeerId([1u8; 20]), 1, config)
            .await
            .unwrap();
        let err = conn.download_piece(0, 4).await.unwrap_err();
        assert!(matches!(err, TorrentError::ConnectionError { .. }));
    }
}
