//! Piece distributor
//!
//! Hands out Pending pieces to peer workers and records their outcome. This is
//! the only place piece state changes.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

use crate::download::ledger::{PieceLedger, PieceStatus};
use crate::error::Result;
use crate::peer::Availability;
use crate::torrent::TorrentInfo;

/// Shared piece assignment state
#[derive(Debug)]
pub struct PieceDistributor {
    ledger: Mutex<PieceLedger>,
    changed: Notify,
}

impl PieceDistributor {
    pub fn new(info: &TorrentInfo) -> Result<Self> {
        Ok(Self {
            ledger: Mutex::new(PieceLedger::from_torrent(info)?),
            changed: Notify::new(),
        })
    }

    fn ledger(&self) -> MutexGuard<'_, PieceLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a random Pending piece the peer can serve.
    ///
    /// Unknown or empty availability makes every Pending piece eligible.
    /// `Ok(None)` means nothing is assignable to this peer right now.
    pub fn acquire(self: &Arc<Self>, peer: SocketAddr, availability: &Availability) -> Result<Option<Assignment>> {
        let mut ledger = self.ledger();
        let candidates: Vec<u32> = ledger
            .iter()
            .filter(|p| p.status == PieceStatus::Pending)
            .filter(|p| availability.may_have(p.index as usize))
            .map(|p| p.index)
            .collect();

        let Some(&index) = candidates.choose(&mut rand::thread_rng()) else {
            return Ok(None);
        };
        let piece = ledger.mark_in_flight(index, peer).map_err(|e| {
            error!("Failed to assign piece {}: {}", index, e);
            e
        })?;
        trace!("Assigned piece {} to {}", index, peer);

        Ok(Some(Assignment {
            distributor: Arc::clone(self),
            index,
            hash: piece.hash,
            length: piece.length,
            settled: false,
        }))
    }

    /// InFlight -> Pending
    pub fn release(&self, index: u32) -> Result<()> {
        self.ledger().mark_pending(index, false)?;
        debug!("Released piece {}", index);
        self.changed.notify_waiters();
        Ok(())
    }

    /// InFlight -> Pending after a failed attempt
    pub fn release_failed(&self, index: u32) -> Result<()> {
        self.ledger().mark_pending(index, true)?;
        debug!("Released failed piece {}", index);
        self.changed.notify_waiters();
        Ok(())
    }

    /// InFlight -> Verified. Any other prior state is an invariant violation.
    pub fn complete(&self, index: u32) -> Result<()> {
        let (verified, total) = {
            let mut ledger = self.ledger();
            ledger.mark_verified(index)?;
            (ledger.verified_count(), ledger.len())
        };
        info!("Piece {} verified ({}/{})", index, verified, total);
        self.changed.notify_waiters();
        Ok(())
    }

    pub fn all_verified(&self) -> bool {
        self.ledger().all_verified()
    }

    pub fn verified_count(&self) -> usize {
        self.ledger().verified_count()
    }

    pub fn piece_count(&self) -> usize {
        self.ledger().len()
    }

    /// Indices not yet Verified
    pub fn missing(&self) -> Vec<u32> {
        self.ledger().missing()
    }

    /// Whether the peer holds any piece that is not Verified yet
    pub fn wants_any(&self, availability: &Availability) -> bool {
        self.ledger()
            .iter()
            .any(|p| p.status != PieceStatus::Verified && availability.may_have(p.index as usize))
    }

    /// Current status of every piece, by index
    pub fn snapshot(&self) -> Vec<PieceStatus> {
        self.ledger().iter().map(|p| p.status).collect()
    }

    /// Resolves on the next state change
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Resolves once every piece is Verified
    pub async fn wait_all_verified(&self) {
        loop {
            let notified = self.changed.notified();
            if self.all_verified() {
                return;
            }
            notified.await;
        }
    }
}

/// Claim on one InFlight piece.
///
/// Dropping an unsettled assignment returns the piece to Pending, so a worker
/// that errors out or gets cancelled never strands its piece.
#[derive(Debug)]
pub struct Assignment {
    distributor: Arc<PieceDistributor>,
    index: u32,
    hash: [u8; 20],
    length: u32,
    settled: bool,
}

impl Assignment {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Mark the piece Verified
    pub fn complete(mut self) -> Result<()> {
        self.settled = true;
        self.distributor.complete(self.index)
    }

    /// Return the piece to Pending, counting a failure
    pub fn fail(mut self) -> Result<()> {
        self.settled = true;
        self.distributor.release_failed(self.index)
    }
}

impl Drop for Assignment {
    fn drop(&mut self) {
        if !self.settled {
            if let Err(e) = self.distributor.release(self.index) {
                error!("Failed to release piece {} on drop: {}", self.index, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorrentError;
    use crate::protocol::Bitfield;
    use std::collections::HashSet;
    use std::time::Duration;

    fn distributor(piece_count: usize) -> Arc<PieceDistributor> {
        let content = vec![7u8; piece_count * 4];
        let info = TorrentInfo::from_content("x", &content, 4);
        Arc::new(PieceDistributor::new(&info).unwrap())
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_double_assignment_under_concurrency() {
        let distributor = distributor(64);
        let mut handles = Vec::new();
        for port in 1..=16u16 {
            let distributor = Arc::clone(&distributor);
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some(assignment) = distributor.acquire(peer(port), &Availability::Unknown).unwrap() {
                    held.push(assignment);
                    tokio::task::yield_now().await;
                }
                held
            }));
        }

        let mut seen = HashSet::new();
        let mut all = Vec::new();
        for handle in handles {
            for assignment in handle.await.unwrap() {
                assert!(seen.insert(assignment.index()), "piece {} assigned twice", assignment.index());
                all.push(assignment);
            }
        }
        assert_eq!(seen.len(), 64);
        assert!(distributor.snapshot().iter().all(|s| matches!(s, PieceStatus::InFlight(_))));
        drop(all);
        assert!(distributor.snapshot().iter().all(|s| *s == PieceStatus::Pending));
    }

    #[test]
    fn test_retry_after_release() {
        let distributor = distributor(1);
        let first = distributor.acquire(peer(1), &Availability::Unknown).unwrap().unwrap();
        assert!(distributor.acquire(peer(2), &Availability::Unknown).unwrap().is_none());

        first.fail().unwrap();
        let second = distributor.acquire(peer(2), &Availability::Unknown).unwrap().unwrap();
        assert_eq!(second.index(), 0);
        assert_eq!(distributor.snapshot(), vec![PieceStatus::InFlight(peer(2))]);

        second.complete().unwrap();
        assert!(distributor.all_verified());
        assert!(distributor.missing().is_empty());
    }

    #[test]
    fn test_double_complete_is_invariant_violation() {
        let distributor = distributor(2);
        let assignment = distributor.acquire(peer(1), &Availability::Unknown).unwrap().unwrap();
        let index = assignment.index();
        assignment.complete().unwrap();

        let err = distributor.complete(index).unwrap_err();
        assert!(matches!(err, TorrentError::DistributorInvariant { .. }));
        assert!(err.is_fatal());
        assert!(distributor.release(index).is_err());
    }

    #[test]
    fn test_acquire_respects_availability() {
        let distributor = distributor(10);
        let mut field = Bitfield::new(10);
        field.set_piece(3);
        let availability = Availability::Known(field);

        let assignment = distributor.acquire(peer(1), &availability).unwrap().unwrap();
        assert_eq!(assignment.index(), 3);
        assert_eq!(assignment.length(), 4);
        assert!(distributor.acquire(peer(2), &availability).unwrap().is_none());
        assert!(distributor.wants_any(&availability));

        assignment.complete().unwrap();
        assert!(!distributor.wants_any(&availability));
        assert_eq!(distributor.verified_count(), 1);
    }

    #[test]
    fn test_empty_bitfield_means_any_piece() {
        let distributor = distributor(3);
        let availability = Availability::Known(Bitfield::new(3));
        assert!(distributor.acquire(peer(1), &availability).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wait_all_verified() {
        let distributor = distributor(2);
        let waiter = {
            let distributor = Arc::clone(&distributor);
            tokio::spawn(async move { distributor.wait_all_verified().await })
        };

        for _ in 0..2 {
            distributor.acquire(peer(1), &Availability::Unknown).unwrap().unwrap().complete().unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    }

    #[test]
    fn test_acquire_after_completion_is_empty_not_error() {
        let distributor = distributor(1);
        distributor.acquire(peer(1), &Availability::Unknown).unwrap().unwrap().complete().unwrap();
        assert!(distributor.acquire(peer(2), &Availability::Unknown).unwrap().is_none());
        // A second settle of the same piece is a fatal invariant error
        let err = distributor.complete(0).unwrap_err();
        assert!(err.is_fatal());
    }
}
