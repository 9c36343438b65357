//! Download session
//!
//! Gathers peers from every enabled provider, then drives one download of the
//! torrent into the output directory.

use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::Config;
use crate::dht::DhtDiscovery;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::Result;
use crate::peer::{dedupe_peers, PeerAddress};
use crate::protocol::PeerId;
use crate::storage::OutputWriter;
use crate::torrent::TorrentInfo;

/// What a provider needs to look up peers for one torrent
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub info: Arc<TorrentInfo>,
    pub peer_id: PeerId,
    /// Port we announce
    pub port: u16,
}

/// A source of peer addresses
#[async_trait]
pub trait PeerProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Look up peers. Must return promptly once `cancel` fires.
    async fn peers(&self, request: &PeerRequest, cancel: CancellationToken) -> Result<Vec<PeerAddress>>;
}

/// Peers given on the command line
#[derive(Debug, Clone, Default)]
pub struct ManualPeers(pub Vec<PeerAddress>);

#[async_trait]
impl PeerProvider for ManualPeers {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn peers(&self, _request: &PeerRequest, _cancel: CancellationToken) -> Result<Vec<PeerAddress>> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "tracker")]
#[async_trait]
impl PeerProvider for crate::tracker::TrackerClient {
    fn name(&self) -> &'static str {
        "tracker"
    }

    async fn peers(&self, request: &PeerRequest, cancel: CancellationToken) -> Result<Vec<PeerAddress>> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(Vec::new()),
            peers = self.announce_all(&request.info, &request.peer_id, request.port) => peers,
        }
    }
}

#[async_trait]
impl PeerProvider for DhtDiscovery {
    fn name(&self) -> &'static str {
        "dht"
    }

    async fn peers(&self, request: &PeerRequest, cancel: CancellationToken) -> Result<Vec<PeerAddress>> {
        let result = self.discover(request.info.info_hash, request.port, cancel).await?;
        for estimate in &result.estimates {
            debug!(
                "Swarm estimate from {}: {:?} peers, {:?} seeds",
                estimate.node, estimate.peers, estimate.seeds
            );
        }
        Ok(result.peers)
    }
}

/// One download of one torrent
pub struct Session {
    config: Config,
    info: Arc<TorrentInfo>,
    peer_id: PeerId,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: Config, info: TorrentInfo) -> Self {
        let peer_id = PeerId::generate();
        debug!("Session peer id: {}", peer_id);
        Self {
            config,
            info: Arc::new(info),
            peer_id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Token that stops discovery and the download when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Providers enabled by the configuration
    pub fn providers(&self) -> Vec<Arc<dyn PeerProvider>> {
        let mut providers: Vec<Arc<dyn PeerProvider>> = Vec::new();
        if !self.config.peers.is_empty() {
            providers.push(Arc::new(ManualPeers(self.config.peers.clone())));
        }

        if self.config.use_tracker {
            #[cfg(feature = "tracker")]
            match crate::tracker::TrackerClient::new(crate::tracker::DEFAULT_TRACKER_TIMEOUT) {
                Ok(client) => providers.push(Arc::new(client)),
                Err(e) => warn!("Tracker announces disabled: {}", e),
            }
            #[cfg(not(feature = "tracker"))]
            warn!("Built without tracker support, skipping tracker announces");
        }

        if self.config.use_dht {
            providers.push(Arc::new(DhtDiscovery::new(self.config.dht.clone())));
        }
        providers
    }

    /// Query every provider concurrently and merge their peers.
    ///
    /// Provider failures are logged; they only shrink the peer list.
    pub async fn gather_peers(&self, providers: Vec<Arc<dyn PeerProvider>>) -> Vec<PeerAddress> {
        let request = PeerRequest {
            info: Arc::clone(&self.info),
            peer_id: self.peer_id,
            port: self.config.port,
        };

        let mut lookups = JoinSet::new();
        for (order, provider) in providers.into_iter().enumerate() {
            let request = request.clone();
            let cancel = self.cancel.child_token();
            lookups.spawn(async move {
                let found = provider.peers(&request, cancel).await;
                (order, provider.name(), found)
            });
        }

        let mut batches = Vec::new();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((order, name, Ok(peers))) => {
                    info!("{} provided {} peer(s)", name, peers.len());
                    batches.push((order, peers));
                }
                Ok((_, name, Err(e))) => warn!("Peer lookup via {} failed: {}", name, e),
                Err(e) => error!("Peer lookup task failed: {}", e),
            }
        }

        // Keep provider order so manual peers win duplicates
        batches.sort_by_key(|(order, _)| *order);
        let peers = dedupe_peers(batches.into_iter().flat_map(|(_, peers)| peers));
        info!("{} unique peer(s) gathered", peers.len());
        peers
    }

    /// Run the session until every piece is written, all peers are exhausted,
    /// or the session is cancelled.
    pub async fn run(&self) -> AnyResult<DownloadOutcome> {
        let peers = self.gather_peers(self.providers()).await;
        if self.cancel.is_cancelled() {
            info!("Session cancelled before the download started");
            return Ok(DownloadOutcome::Incomplete {
                missing: (0..self.info.piece_count() as u32).collect(),
            });
        }

        let writer = OutputWriter::create(&self.config.output_dir, &self.info)
            .await
            .with_context(|| format!("Failed to prepare output in {}", self.config.output_dir.display()))?;
        for path in writer.paths() {
            debug!("Writing to {}", path.display());
        }

        let downloader = Downloader::new(
            Arc::clone(&self.info),
            self.peer_id,
            self.config.peer.clone(),
            self.config.max_connections,
        )
        .with_cancellation(self.cancel.clone());

        let outcome = downloader.download(peers, writer).await.context("Download failed")?;
        match &outcome {
            DownloadOutcome::Complete { pieces, bytes } => {
                info!("Downloaded '{}': {} pieces, {} bytes", self.info.name, pieces, bytes);
            }
            DownloadOutcome::Incomplete { missing } => {
                warn!("Download of '{}' incomplete: {} piece(s) missing", self.info.name, missing.len());
            }
        }
        Ok(outcome)
    }

    /// Like [`Session::run`], cancelling the session on Ctrl-C
    pub async fn run_until_interrupted(&self) -> AnyResult<DownloadOutcome> {
        let cancel = self.cancel.clone();
        let interrupt = tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        warn!("Interrupted, shutting down");
                        cancel.cancel();
                    }
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                },
                _ = cancel.cancelled() => {}
            }
        });

        let outcome = self.run().await;
        interrupt.abort();
        outcome
    }
}
