//! Piece ledger
//!
//! Per-piece status records and the legal transitions between them.

use std::net::SocketAddr;

use crate::error::{Result, TorrentError};
use crate::torrent::TorrentInfo;

/// Status of a single piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Not yet downloaded and not assigned to anyone
    Pending,
    /// Assigned to the given peer
    InFlight(SocketAddr),
    /// Downloaded and hash-checked
    Verified,
}

/// One ledger entry
#[derive(Debug, Clone)]
pub struct PieceState {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
    pub status: PieceStatus,
    /// Failed attempts (hash mismatch) so far
    pub failures: u32,
}

/// All piece states of a session
#[derive(Debug)]
pub struct PieceLedger {
    pieces: Vec<PieceState>,
    verified: usize,
}

impl PieceLedger {
    /// Create a ledger with every piece Pending
    pub fn from_torrent(info: &TorrentInfo) -> Result<Self> {
        let mut pieces = Vec::with_capacity(info.piece_count());
        for (index, hash) in info.pieces.iter().enumerate() {
            let size = info.piece_size(index).unwrap_or(0);
            let length = u32::try_from(size).map_err(|_| {
                TorrentError::validation_error_with_field(
                    format!("piece {} is too large: {} bytes", index, size),
                    "piece_length",
                )
            })?;
            pieces.push(PieceState {
                index: index as u32,
                hash: *hash,
                length,
                status: PieceStatus::Pending,
                failures: 0,
            });
        }
        Ok(Self { pieces, verified: 0 })
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PieceState> {
        self.pieces.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceState> {
        self.pieces.iter()
    }

    pub fn verified_count(&self) -> usize {
        self.verified
    }

    pub fn all_verified(&self) -> bool {
        self.verified == self.pieces.len()
    }

    /// Indices of every piece not yet Verified
    pub fn missing(&self) -> Vec<u32> {
        self.pieces
            .iter()
            .filter(|p| p.status != PieceStatus::Verified)
            .map(|p| p.index)
            .collect()
    }

    /// Pending -> InFlight
    pub fn mark_in_flight(&mut self, index: u32, peer: SocketAddr) -> Result<&PieceState> {
        let piece = self.entry_mut(index)?;
        if piece.status != PieceStatus::Pending {
            return Err(TorrentError::invariant_error(
                format!("cannot assign piece in state {:?}", piece.status),
                index,
            ));
        }
        piece.status = PieceStatus::InFlight(peer);
        Ok(piece)
    }

    /// InFlight -> Pending, counting a failure when `failed` is set
    pub fn mark_pending(&mut self, index: u32, failed: bool) -> Result<()> {
        let piece = self.entry_mut(index)?;
        if !matches!(piece.status, PieceStatus::InFlight(_)) {
            return Err(TorrentError::invariant_error(
                format!("cannot release piece in state {:?}", piece.status),
                index,
            ));
        }
        piece.status = PieceStatus::Pending;
        if failed {
            piece.failures += 1;
        }
        Ok(())
    }

    /// InFlight -> Verified
    pub fn mark_verified(&mut self, index: u32) -> Result<()> {
        let piece = self.entry_mut(index)?;
        if !matches!(piece.status, PieceStatus::InFlight(_)) {
            return Err(TorrentError::invariant_error(
                format!("cannot complete piece in state {:?}", piece.status),
                index,
            ));
        }
        piece.status = PieceStatus::Verified;
        self.verified += 1;
        Ok(())
    }

    fn entry_mut(&mut self, index: u32) -> Result<&mut PieceState> {
        self.pieces
            .get_mut(index as usize)
            .ok_or_else(|| TorrentError::invariant_error("piece index out of range", index))
    }
}
