//! Download orchestrator
//!
//! Spawns one worker per peer, feeds the output writer, and decides when the
//! session is over.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::PieceDistributor;
use crate::error::{Result, TorrentError};
use crate::peer::{dedupe_peers, PeerAddress, PeerConfig, PeerWorker, Transport};
use crate::protocol::PeerId;
use crate::storage::OutputWriter;
use crate::torrent::TorrentInfo;

/// Capacity of the verified-piece channel
const PIECE_CHANNEL_CAPACITY: usize = 32;

/// How a download session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Every piece was verified and written
    Complete { pieces: usize, bytes: u64 },
    /// All workers exited (or the session was cancelled) with pieces missing
    Incomplete { missing: Vec<u32> },
}

impl DownloadOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, DownloadOutcome::Complete { .. })
    }
}

/// Runs one download session against a list of peers
pub struct Downloader {
    info: Arc<TorrentInfo>,
    peer_id: PeerId,
    config: PeerConfig,
    max_connections: usize,
    cancel: CancellationToken,
}

impl Downloader {
    pub fn new(info: Arc<TorrentInfo>, peer_id: PeerId, config: PeerConfig, max_connections: usize) -> Self {
        Self {
            info,
            peer_id,
            config,
            max_connections: max_connections.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the session early when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Download every piece from `peers` and write it through `writer`
    pub async fn download(&self, peers: Vec<PeerAddress>, writer: OutputWriter) -> Result<DownloadOutcome> {
        let distributor = Arc::new(PieceDistributor::new(&self.info)?);
        let cancel = self.cancel.child_token();

        let peers: Vec<_> = dedupe_peers(peers)
            .into_iter()
            .filter(|peer| {
                if peer.transport != Transport::Tcp {
                    warn!("Skipping {:?} peer {}: transport not supported", peer.transport, peer);
                    return false;
                }
                true
            })
            .collect();
        info!(
            "Starting download of '{}': {} pieces from {} peer(s), {} connection(s) max",
            self.info.name,
            distributor.piece_count(),
            peers.len(),
            self.max_connections
        );

        let (pieces_tx, pieces_rx) = mpsc::channel(PIECE_CHANNEL_CAPACITY);
        let mut writer_handle = tokio::spawn(writer.run(pieces_rx));

        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut workers = JoinSet::new();
        for peer in peers {
            let worker = PeerWorker::new(
                peer.socket_addr(),
                Arc::clone(&self.info),
                Arc::clone(&distributor),
                pieces_tx.clone(),
                self.peer_id,
                self.config.clone(),
                cancel.clone(),
            );
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Ok(()),
                    },
                    _ = cancel.cancelled() => return Ok(()),
                };
                worker.run().await
            });
        }
        drop(pieces_tx);

        let mut fatal: Option<TorrentError> = None;
        let mut writer_result = None;
        loop {
            tokio::select! {
                _ = distributor.wait_all_verified() => {
                    info!("All {} pieces verified", distributor.piece_count());
                    break;
                }
                _ = cancel.cancelled() => {
                    warn!("Download cancelled");
                    break;
                }
                joined = workers.join_next() => match joined {
                    None => {
                        debug!("All workers have exited");
                        break;
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        fatal = Some(e);
                        break;
                    }
                    Some(Err(e)) => error!("Worker task failed: {}", e),
                },
                result = &mut writer_handle => {
                    writer_result = Some(result);
                    break;
                }
            }
        }

        cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Err(e)) if fatal.is_none() => fatal = Some(e),
                Ok(_) => {}
                Err(e) => error!("Worker task failed: {}", e),
            }
        }

        let writer_result = match writer_result {
            Some(result) => result,
            None => writer_handle.await,
        };
        let written = writer_result
            .map_err(|e| TorrentError::storage_error(format!("Output writer task failed: {}", e)))?;

        if let Some(e) = fatal {
            error!("Download aborted: {}", e);
            return Err(e);
        }
        let written = written?;

        if distributor.all_verified() {
            info!("Download complete: {} pieces written", written);
            Ok(DownloadOutcome::Complete {
                pieces: distributor.piece_count(),
                bytes: self.info.total_size(),
            })
        } else {
            let missing = distributor.missing();
            warn!("Download incomplete: {} piece(s) missing", missing.len());
            Ok(DownloadOutcome::Incomplete { missing })
        }
    }
}
