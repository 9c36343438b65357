//! Peer worker
//!
//! Drives one peer connection: pulls assignments from the distributor,
//! downloads and hash-checks pieces, and forwards them to the output writer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::PieceDistributor;
use crate::error::{Result, TorrentError};
use crate::peer::connection::{PeerConfig, PeerConnection};
use crate::protocol::PeerId;
use crate::storage::VerifiedPiece;
use crate::torrent::{sha1_digest, TorrentInfo};

/// Per-peer download task
pub struct PeerWorker {
    addr: SocketAddr,
    info: Arc<TorrentInfo>,
    distributor: Arc<PieceDistributor>,
    pieces_tx: mpsc::Sender<VerifiedPiece>,
    peer_id: PeerId,
    config: PeerConfig,
    cancel: CancellationToken,
}

impl PeerWorker {
    pub fn new(
        addr: SocketAddr,
        info: Arc<TorrentInfo>,
        distributor: Arc<PieceDistributor>,
        pieces_tx: mpsc::Sender<VerifiedPiece>,
        peer_id: PeerId,
        config: PeerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            addr,
            info,
            distributor,
            pieces_tx,
            peer_id,
            config,
            cancel,
        }
    }

    /// Run until done, cancelled or the peer fails.
    ///
    /// Peer-local errors are logged and swallowed; only fatal errors are
    /// returned.
    pub async fn run(self) -> Result<()> {
        let addr = self.addr;
        let cancel = self.cancel.clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Worker for {} cancelled", addr);
                Ok(())
            }
            result = self.download_loop() => result,
        };

        match result {
            Err(e) if e.is_fatal() => {
                error!("Worker for {} hit a fatal error: {}", addr, e);
                Err(e)
            }
            Err(e) => {
                debug!("Worker for {} stopped: {}", addr, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn download_loop(&self) -> Result<()> {
        let mut conn = PeerConnection::establish(
            self.addr,
            self.info.info_hash,
            self.peer_id,
            self.info.piece_count(),
            self.config.clone(),
        )
        .await?;

        let mut hash_failures = 0u32;
        let mut downloaded = 0usize;

        loop {
            if self.distributor.all_verified() {
                debug!("All pieces verified, closing {}", self.addr);
                break;
            }

            let Some(assignment) = self.distributor.acquire(self.addr, conn.availability())? else {
                if !self.distributor.wants_any(conn.availability()) {
                    debug!("Peer {} has no piece we still need", self.addr);
                    break;
                }
                // The peer's remaining pieces are in flight elsewhere; wait for
                // one of them to be released or completed.
                let _ = timeout(self.config.read_timeout, self.distributor.changed()).await;
                continue;
            };

            let index = assignment.index();
            let data = conn.download_piece(index, assignment.length()).await?;

            if sha1_digest(&data) != *assignment.hash() {
                let err = TorrentError::integrity_error(index, self.addr.to_string());
                warn!("{}", err);
                assignment.fail()?;
                hash_failures += 1;
                if hash_failures >= self.config.max_hash_failures {
                    warn!("Closing {} after {} hash failures", self.addr, hash_failures);
                    break;
                }
                continue;
            }

            // Reserve the channel slot first so a verified piece always reaches the writer.
            let Ok(permit) = self.pieces_tx.reserve().await else {
                debug!("Output writer has stopped, closing {}", self.addr);
                break;
            };
            assignment.complete()?;
            permit.send(VerifiedPiece { index, data });
            downloaded += 1;
        }

        conn.close();
        info!("Peer {} finished after {} piece(s)", self.addr, downloaded);
        Ok(())
    }
}
