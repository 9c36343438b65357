//! Wire protocol framing
//!
//! Reads and writes handshakes and length-prefixed messages on an async stream.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::{Result, TorrentError};

/// Largest message payload accepted from a peer.
///
/// A 16 KiB block plus header fits comfortably; anything bigger is treated as
/// a framing error rather than allocated.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Framing helper bound to one remote peer, used for error attribution
#[derive(Debug, Clone)]
pub struct BitTorrentWire {
    peer: String,
    max_message_len: usize,
}

impl BitTorrentWire {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    /// Override the maximum accepted payload length
    pub fn with_max_message_len(mut self, max: usize) -> Self {
        self.max_message_len = max;
        self
    }

    /// Read a complete message from the stream
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message> {
        let mut length_buf = [0u8; 4];
        reader
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| self.io_error("Failed to read message length", e))?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length == 0 {
            trace!("KeepAlive from {}", self.peer);
            return Ok(Message::KeepAlive);
        }

        if length > self.max_message_len {
            error!("Peer {} sent oversized message: {} bytes", self.peer, length);
            return Err(TorrentError::protocol_error_with_source(
                "Message exceeds maximum length",
                format!("{} > {}", length, self.max_message_len),
            )
            .with_peer(&self.peer));
        }

        let mut payload = BytesMut::zeroed(length);
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| self.io_error("Failed to read message payload", e))?;

        Message::decode(payload.freeze()).map_err(|e| e.with_peer(&self.peer))
    }

    /// Write a message to the stream
    pub async fn write_message<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let encoded: Bytes = message.encode();
        writer
            .write_all(&encoded)
            .await
            .map_err(|e| self.io_error("Failed to write message", e))?;
        writer
            .flush()
            .await
            .map_err(|e| self.io_error("Failed to flush message", e))?;
        Ok(())
    }

    /// Read a handshake from the stream
    pub async fn read_handshake<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TorrentError::protocol_error_with_source("Short handshake", e.to_string()).with_peer(&self.peer)
            } else {
                self.io_error("Failed to read handshake", e)
            }
        })?;
        Handshake::deserialize(&buf).map_err(|e| e.with_peer(&self.peer))
    }

    /// Write a handshake to the stream
    pub async fn write_handshake<W: AsyncWrite + Unpin>(&self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer
            .write_all(&handshake.serialize())
            .await
            .map_err(|e| self.io_error("Failed to write handshake", e))?;
        writer
            .flush()
            .await
            .map_err(|e| self.io_error("Failed to flush handshake", e))?;
        Ok(())
    }

    fn io_error(&self, context: &str, err: std::io::Error) -> TorrentError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TorrentError::connection_error_full("Peer closed the stream", &self.peer, context)
        } else {
            TorrentError::connection_error_full(context, &self.peer, err.to_string())
        }
    }
}
