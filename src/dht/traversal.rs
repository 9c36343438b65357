//! DHT peer discovery
//!
//! One-shot iterative `get_peers` lookup for an info hash. Runs until the
//! lookup converges, the query budget is spent, or the caller cancels.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dht::bloom::estimate_count;
use crate::dht::message::{KrpcMessage, Query, Response};
use crate::dht::node::NodeId;
use crate::error::{Result, TorrentError};
use crate::peer::PeerAddress;

/// Bucket size: how many of the closest nodes the lookup must query
pub const K: usize = 8;

/// Well-known bootstrap routers
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

const MAX_DATAGRAM: usize = 4096;

/// DHT lookup settings
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Local UDP address to bind
    pub bind_addr: SocketAddr,
    /// `host:port` bootstrap routers
    pub bootstrap_nodes: Vec<String>,
    /// Maximum queries in flight
    pub alpha: usize,
    /// Total query budget
    pub max_queries: usize,
    /// Per-query timeout
    pub query_timeout: Duration,
    /// Overall budget for one lookup
    pub lookup_timeout: Duration,
    /// Send `announce_peer` to the closest responders after a completed lookup
    pub announce: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            bootstrap_nodes: DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            alpha: 3,
            max_queries: 200,
            query_timeout: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(60),
            announce: true,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alpha == 0 {
            return Err(TorrentError::config_error_with_field("alpha must be at least 1", "alpha"));
        }
        if self.max_queries == 0 {
            return Err(TorrentError::config_error_with_field("max queries must be at least 1", "max_queries"));
        }
        if self.query_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("query timeout must be positive", "query_timeout"));
        }
        if self.lookup_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("lookup timeout must be positive", "lookup_timeout"));
        }
        Ok(())
    }
}

/// Swarm size a node claimed through its scrape filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmEstimate {
    pub node: SocketAddr,
    pub peers: Option<u64>,
    pub seeds: Option<u64>,
}

/// Outcome of a lookup
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    /// Deduplicated peers
    pub peers: Vec<PeerAddress>,
    /// Nodes we sent a `get_peers` query to
    pub nodes_contacted: usize,
    /// Distinct IPs among `peers`
    pub distinct_ips: usize,
    pub estimates: Vec<SwarmEstimate>,
}

/// Iterative DHT peer lookup
#[derive(Debug, Clone)]
pub struct DhtDiscovery {
    config: DhtConfig,
}

impl DhtDiscovery {
    pub fn new(config: DhtConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Look up peers for `info_hash`; `port` is what we announce.
    ///
    /// An empty peer list is a valid result. The socket is closed on every
    /// return path.
    pub async fn discover(&self, info_hash: [u8; 20], port: u16, cancel: CancellationToken) -> Result<DiscoveryResult> {
        self.config.validate()?;

        let socket = UdpSocket::bind(self.config.bind_addr).await.map_err(|e| {
            TorrentError::discovery_error_full("Failed to bind DHT socket", self.config.bind_addr.to_string(), e.to_string())
        })?;
        let local = socket.local_addr().ok();

        let bootstrap = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("DHT lookup cancelled during bootstrap resolution");
                return Ok(DiscoveryResult::default());
            }
            resolved = self.resolve_bootstrap(local) => resolved?,
        };

        let lookup_deadline = Instant::now() + self.config.lookup_timeout;
        let mut traversal = Traversal::new(NodeId::random(), NodeId::new(info_hash), &self.config);
        info!(
            "Starting DHT lookup for {} from {} bootstrap node(s)",
            hex::encode(info_hash),
            bootstrap.len()
        );
        for addr in bootstrap {
            traversal.add_bootstrap(addr);
        }

        let completed = traversal.run(&socket, &cancel, lookup_deadline).await;
        if completed && self.config.announce {
            traversal.announce(&socket, port).await;
        }
        drop(socket);

        let result = traversal.into_result();
        info!(
            "DHT lookup for {} finished: {} peers, {} distinct IPs, {} nodes contacted",
            hex::encode(info_hash),
            result.peers.len(),
            result.distinct_ips,
            result.nodes_contacted
        );
        Ok(result)
    }

    async fn resolve_bootstrap(&self, local: Option<SocketAddr>) -> Result<Vec<SocketAddr>> {
        let want_v4 = local.map_or(true, |l| l.is_ipv4());
        let mut resolved = Vec::new();
        for host in &self.config.bootstrap_nodes {
            match tokio::time::timeout(self.config.query_timeout, lookup_host(host.as_str())).await {
                Ok(Ok(addrs)) => {
                    resolved.extend(addrs.filter(|a| a.is_ipv4() == want_v4));
                }
                Ok(Err(e)) => warn!("Failed to resolve DHT bootstrap node {}: {}", host, e),
                Err(_) => warn!("Timed out resolving DHT bootstrap node {}", host),
            }
        }
        resolved.dedup();
        if resolved.is_empty() {
            return Err(TorrentError::discovery_error("No DHT bootstrap node could be resolved"));
        }
        Ok(resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Fresh,
    Queried,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    addr: SocketAddr,
    /// Unknown for bootstrap routers until they answer
    id: Option<NodeId>,
    state: CandidateState,
    token: Option<Vec<u8>>,
}

#[derive(Debug)]
struct PendingQuery {
    candidate: usize,
    deadline: Instant,
}

/// Mutable lookup state; lives only for one `discover` call
struct Traversal {
    our_id: NodeId,
    target: NodeId,
    alpha: usize,
    max_queries: usize,
    query_timeout: Duration,
    candidates: Vec<Candidate>,
    known_addrs: HashSet<SocketAddr>,
    pending: HashMap<Vec<u8>, PendingQuery>,
    next_transaction: u16,
    queries_sent: usize,
    peers: Vec<PeerAddress>,
    peer_keys: HashSet<String>,
    estimates: Vec<SwarmEstimate>,
}

impl Traversal {
    fn new(our_id: NodeId, target: NodeId, config: &DhtConfig) -> Self {
        Self {
            our_id,
            target,
            alpha: config.alpha,
            max_queries: config.max_queries,
            query_timeout: config.query_timeout,
            candidates: Vec::new(),
            known_addrs: HashSet::new(),
            pending: HashMap::new(),
            next_transaction: rand::random(),
            queries_sent: 0,
            peers: Vec::new(),
            peer_keys: HashSet::new(),
            estimates: Vec::new(),
        }
    }

    fn add_bootstrap(&mut self, addr: SocketAddr) {
        if self.known_addrs.insert(addr) {
            self.candidates.push(Candidate {
                addr,
                id: None,
                state: CandidateState::Fresh,
                token: None,
            });
        }
    }

    fn add_node(&mut self, id: NodeId, addr: SocketAddr) {
        if id == self.our_id || addr.port() == 0 || !self.known_addrs.insert(addr) {
            return;
        }
        self.candidates.push(Candidate {
            addr,
            id: Some(id),
            state: CandidateState::Fresh,
            token: None,
        });
    }

    /// Bootstrap routers first, then the closest fresh node among the K
    /// closest nodes that have not failed.
    fn next_candidate(&self) -> Option<usize> {
        if let Some(i) = self
            .candidates
            .iter()
            .position(|c| c.id.is_none() && c.state == CandidateState::Fresh)
        {
            return Some(i);
        }

        let mut live: Vec<usize> = (0..self.candidates.len())
            .filter(|&i| self.candidates[i].id.is_some() && self.candidates[i].state != CandidateState::Failed)
            .collect();
        live.sort_by_key(|&i| self.candidates[i].id.map(|id| id.distance(&self.target)));
        live.into_iter()
            .take(K)
            .find(|&i| self.candidates[i].state == CandidateState::Fresh)
    }

    fn transaction_id(&mut self) -> Vec<u8> {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        self.next_transaction.to_be_bytes().to_vec()
    }

    async fn send_query(&mut self, socket: &UdpSocket, index: usize) {
        let tid = self.transaction_id();
        let addr = self.candidates[index].addr;
        self.candidates[index].state = CandidateState::Queried;
        self.queries_sent += 1;

        let query = Query::GetPeers { info_hash: *self.target.as_bytes() };
        let sent = match query.encode(&tid, &self.our_id) {
            Ok(datagram) => socket.send_to(&datagram, addr).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match sent {
            Ok(_) => {
                trace!("Sent get_peers to {}", addr);
                self.pending.insert(
                    tid,
                    PendingQuery {
                        candidate: index,
                        deadline: Instant::now() + self.query_timeout,
                    },
                );
            }
            Err(e) => {
                debug!("Failed to send get_peers to {}: {}", addr, e);
                self.candidates[index].state = CandidateState::Failed;
            }
        }
    }

    /// Drive the lookup. Returns true on natural completion, false when
    /// cancelled or out of time.
    async fn run(&mut self, socket: &UdpSocket, cancel: &CancellationToken, lookup_deadline: Instant) -> bool {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if cancel.is_cancelled() {
                self.drain(socket, &mut buf);
                return false;
            }

            while self.pending.len() < self.alpha && self.queries_sent < self.max_queries {
                let Some(index) = self.next_candidate() else { break };
                self.send_query(socket, index).await;
            }

            let Some(deadline) = self.pending.values().map(|p| p.deadline).min() else {
                debug!("DHT lookup converged after {} queries", self.queries_sent);
                return true;
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("DHT lookup cancelled with {} queries in flight", self.pending.len());
                    self.drain(socket, &mut buf);
                    return false;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                    Err(e) => debug!("DHT socket receive error: {}", e),
                },
                _ = sleep_until(deadline) => self.expire(Instant::now()),
                _ = sleep_until(lookup_deadline) => {
                    debug!("DHT lookup ran out of time after {} queries", self.queries_sent);
                    self.drain(socket, &mut buf);
                    return false;
                }
            }
        }
    }

    /// Process datagrams that already arrived, without waiting for more
    fn drain(&mut self, socket: &UdpSocket, buf: &mut [u8]) {
        while let Ok((len, from)) = socket.try_recv_from(buf) {
            self.handle_datagram(&buf[..len], from);
        }
        self.pending.clear();
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in expired {
            if let Some(pending) = self.pending.remove(&tid) {
                trace!("get_peers to {} timed out", self.candidates[pending.candidate].addr);
                self.candidates[pending.candidate].state = CandidateState::Failed;
            }
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let message = match KrpcMessage::decode(data, from) {
            Ok(message) => message,
            Err(e) => {
                trace!("Ignoring datagram: {}", e);
                return;
            }
        };
        let Some(pending) = self.pending.get(message.transaction_id()) else {
            trace!("Unexpected transaction from {}", from);
            return;
        };
        let index = pending.candidate;
        if self.candidates[index].addr != from {
            trace!("Transaction reply from unexpected address {}", from);
            return;
        }
        self.pending.remove(message.transaction_id());

        match message {
            KrpcMessage::Response { response, .. } => self.handle_response(index, response),
            KrpcMessage::Error { code, message, .. } => {
                debug!("DHT node {} returned error {}: {}", from, code, message);
                self.candidates[index].state = CandidateState::Failed;
            }
            KrpcMessage::Query { method, .. } => {
                trace!("Ignoring {} query from {}", method, from);
            }
        }
    }

    fn handle_response(&mut self, index: usize, response: Response) {
        let addr = self.candidates[index].addr;
        {
            let candidate = &mut self.candidates[index];
            candidate.state = CandidateState::Responded;
            if candidate.id.is_none() {
                candidate.id = response.id;
            }
            candidate.token = response.token;
        }

        for node in response.nodes {
            self.add_node(node.id, node.addr);
        }

        for peer in response.values {
            if self.peer_keys.insert(peer.key()) {
                debug!("Got peer {} from {}", peer, addr);
                self.peers.push(peer);
            }
        }

        let peers = response.bf_peers.as_deref().and_then(estimate_count);
        let seeds = response.bf_seeds.as_deref().and_then(estimate_count);
        if peers.is_some() || seeds.is_some() {
            if let Some(count) = peers {
                info!("{} claims {} peers", addr, count);
            }
            if let Some(count) = seeds {
                info!("{} claims {} seeds", addr, count);
            }
            self.estimates.push(SwarmEstimate { node: addr, peers, seeds });
        }
    }

    /// Fire-and-forget `announce_peer` to the closest responders with a token
    async fn announce(&mut self, socket: &UdpSocket, port: u16) {
        let mut targets: Vec<(NodeId, SocketAddr, Vec<u8>)> = self
            .candidates
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| Some((c.id?, c.addr, c.token.clone()?)))
            .collect();
        targets.sort_by_key(|(id, _, _)| id.distance(&self.target));
        targets.truncate(K);

        for (_, addr, token) in targets {
            let tid = self.transaction_id();
            let query = Query::AnnouncePeer {
                info_hash: *self.target.as_bytes(),
                port,
                token,
            };
            match query.encode(&tid, &self.our_id) {
                Ok(datagram) => {
                    if let Err(e) = socket.send_to(&datagram, addr).await {
                        debug!("Failed to announce to {}: {}", addr, e);
                    } else {
                        trace!("Announced port {} to {}", port, addr);
                    }
                }
                Err(e) => debug!("Failed to encode announce: {}", e),
            }
        }
    }

    fn into_result(self) -> DiscoveryResult {
        let distinct_ips = self
            .peers
            .iter()
            .map(|p| p.normalized_ip())
            .collect::<HashSet<IpAddr>>()
            .len();
        DiscoveryResult {
            peers: self.peers,
            nodes_contacted: self.queries_sent,
            distinct_ips,
            estimates: self.estimates,
        }
    }
}
