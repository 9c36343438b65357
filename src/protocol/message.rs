//! BitTorrent protocol messages
//!
//! Length-prefixed peer messages and their binary layout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};

use crate::error::{Result, TorrentError};

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(TorrentError::protocol_error_with_source(
                "Invalid message ID",
                format!("value: {}", value),
            )),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive => None,
        }
    }

    /// Payload length, excluding the 4-byte prefix
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
        }
    }

    /// Encode the message including its length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            _ => {}
        }

        trace!("Encoded {:?}: {} bytes", self.message_id(), buf.len());
        buf.freeze()
    }

    /// Decode a message payload (the bytes after the length prefix)
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(payload.get_u8())?;
        let body_len = payload.remaining();

        let fixed = |expected: usize| -> Result<()> {
            if body_len != expected {
                error!("{:?} message has {} payload bytes, expected {}", id, body_len, expected);
                return Err(TorrentError::protocol_error_with_source(
                    format!("Malformed {:?} message", id),
                    format!("expected {} bytes, got {}", expected, body_len),
                ));
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                fixed(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                fixed(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                fixed(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                fixed(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                fixed(4)?;
                Message::Have { piece_index: payload.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request => {
                fixed(12)?;
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Piece => {
                if body_len < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", body_len),
                    ));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece { index, begin, block: payload }
            }
            MessageId::Cancel => {
                fixed(12)?;
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            MessageId::Port => {
                fixed(2)?;
                Message::Port { listen_port: payload.get_u16() }
            }
        };

        trace!("Decoded {:?}", id);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(message: &Message) -> Bytes {
        message.encode().slice(4..)
    }

    #[test]
    fn test_keepalive_layout() {
        assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
        assert_eq!(Message::decode(Bytes::new()).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_layout() {
        let encoded = Message::Request { index: 1, begin: 16384, length: 16384 }.encode();
        assert_eq!(
            &encoded[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_decode_piece_keeps_block() {
        let message = Message::Piece {
            index: 10,
            begin: 4,
            block: Bytes::from_static(b"abcde"),
        };
        assert_eq!(message.length(), 14);
        assert_eq!(Message::decode(payload_of(&message)).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_short_have() {
        let payload = Bytes::from_static(&[4, 0, 0]);
        assert!(matches!(
            Message::decode(payload),
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes_on_unchoke() {
        assert!(Message::decode(Bytes::from_static(&[1, 0])).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_id() {
        assert!(Message::decode(Bytes::from_static(&[20])).is_err());
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(9).unwrap(), MessageId::Port);
        assert!(MessageId::try_from(10).is_err());
    }
}
