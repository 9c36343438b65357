//! Piece availability bitfield
//!
//! High bit of the first byte is piece 0.

use bytes::Bytes;

use crate::error::{Result, TorrentError};

/// The set of pieces a remote peer claims to hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
    held: usize,
}

impl Bitfield {
    /// Empty bitfield for `piece_count` pieces
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0u8; piece_count.div_ceil(8)],
            piece_count,
            held: 0,
        }
    }

    /// Validate a received bitfield payload.
    ///
    /// The byte length must be exactly `ceil(piece_count / 8)`; spare trailing
    /// bits are ignored.
    pub fn from_payload(payload: &Bytes, piece_count: usize) -> Result<Self> {
        let expected = piece_count.div_ceil(8);
        if payload.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", expected, payload.len()),
            ));
        }
        let mut field = Self::new(piece_count);
        field.bits.copy_from_slice(payload);
        field.held = (0..piece_count).filter(|&i| field.has_piece(i)).count();
        Ok(field)
    }

    /// Number of pieces this bitfield covers
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Check whether the peer has a piece
    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] & (1 << bit_index) != 0
    }

    /// Mark a piece as held; out-of-range indices are ignored
    pub fn set_piece(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        if self.has_piece(index) {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
        self.held += 1;
    }

    /// True when no piece is set
    pub fn is_empty(&self) -> bool {
        self.held == 0
    }

    /// Number of held pieces
    pub fn count(&self) -> usize {
        self.held
    }

    /// Indices of every held piece
    pub fn pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(move |&i| self.has_piece(i))
    }

    /// Raw bytes as sent on the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
