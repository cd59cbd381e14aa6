//! Core DHT logic: identity space, routing table, connection-layer seam, and
//! the query engine.
//!
//! This module contains the building blocks of the DHT:
//!
//! - **Identity & Hashing**: [`PeerId`], [`Key`], [`derive_peer_id`], [`hash_content`]
//! - **Distance metric**: [`xor_distance`] for Kademlia-style routing
//! - **Routing**: [`RoutingTable`], [`Peer`] for peer selection
//! - **Connection layer seam**: the [`Swarm`] and [`ProtocolHandler`] traits
//! - **Query engine**: [`Dht`] with the peer-lookup and provider-lookup
//!   algorithms, lifecycle, and inbound request handling

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DhtError;
use crate::protocol::{
    parse_descriptors, read_message, write_message, DhtMessage, MessageType, PeerDescriptor,
    PROTOCOL_ID,
};

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for peers, derived as a digest of identity material.
pub type PeerId = [u8; 32];

/// A 256-bit content-addressed key. Content keys and peer identities share
/// one metric space, so a [`PeerId`] is also a valid lookup key.
pub type Key = [u8; 32];

// ============================================================================
// Configuration Constants
// ============================================================================

/// Peers queried concurrently within one provider-lookup round.
const ROUND_FANOUT: usize = 3;

/// Ceiling on a single peer's dial-plus-exchange.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Ceiling on one whole fan-out round.
const ROUND_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Hashing Functions
// ============================================================================

fn blake3_digest(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Derive a stable [`PeerId`] by hashing arbitrary identity material.
///
/// ```
/// use kad_dht::derive_peer_id;
///
/// let id = derive_peer_id(b"example-public-key-bytes");
/// assert_eq!(id, derive_peer_id(b"example-public-key-bytes"));
/// ```
pub fn derive_peer_id(data: &[u8]) -> PeerId {
    blake3_digest(data)
}

/// Compute a content-addressed [`Key`] as the digest of content bytes.
pub fn hash_content(data: &[u8]) -> Key {
    blake3_digest(data)
}

/// Short hex rendering of an id for log lines.
pub(crate) fn short_id(id: &PeerId) -> String {
    hex::encode(&id[..6])
}

// ============================================================================
// Distance Metric
// ============================================================================

/// Compute the XOR distance between two identifiers.
///
/// # Properties
/// - `xor_distance(a, a) == [0; 32]`
/// - `xor_distance(a, b) == xor_distance(b, a)`
/// - Compared as an unsigned big-endian integer via [`distance_cmp`].
pub fn xor_distance(a: &Key, b: &Key) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compare two XOR distances as unsigned big-endian integers.
fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

// ============================================================================
// Peers
// ============================================================================

/// A known network participant: identity plus opaque address hints.
///
/// Address and connection state are owned by the connection layer; the hints
/// carried here exist so a peer learned from a query response can be handed
/// back to [`Swarm::register_peer`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Peer {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

// ============================================================================
// Routing Table
// ============================================================================

/// The set of peers tracked for routing, ordered on demand by XOR distance.
///
/// The local node's own identity is the distance origin and is never stored,
/// so it is never returned as a "nearest peer" to itself. Insertion is
/// idempotent: re-adding a known identity never duplicates the entry and
/// never overwrites it with newer metadata.
///
/// Internal organization is a flat identity map. Every query sorts all
/// tracked peers; a bucketed layout keyed on leading-zero bits of the
/// distance would speed this up without changing any observable behavior.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    peers: HashMap<PeerId, Peer>,
}

impl RoutingTable {
    /// Create a routing table with the given local identity as origin.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
        }
    }

    /// Track a peer. Re-adding an existing identity is a no-op; the local
    /// identity is ignored.
    pub fn add(&mut self, peer: Peer) {
        if peer.id == self.local_id {
            return;
        }
        self.peers.entry(peer.id).or_insert(peer);
    }

    /// All tracked peers, sorted ascending by XOR distance to `target`.
    ///
    /// Produces a fresh sequence on every call; ties (only possible for an
    /// identical id) break on raw id bytes for determinism.
    pub fn nearest_peers(&self, target: &Key) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            let da = xor_distance(&a.id, target);
            let db = xor_distance(&b.id, target);
            distance_cmp(&da, &db).then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Layer Seam
// ─────────────────────────────────────────────────────────────────────────────

/// A bidirectional byte stream to one peer, as handed out by the connection
/// layer after protocol negotiation.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Boxed stream form used across the [`Swarm`] seam.
pub type SwarmStream = Box<dyn PeerStream>;

/// The connection layer as consumed by the DHT.
///
/// Dialing, multiplexing, and encryption live behind this trait; the DHT only
/// needs to open a protocol stream to a peer, keep the shared peer registry
/// in sync, and hear about newly discovered peers. Registration must be
/// idempotent: handing in the same identity twice yields one canonical
/// instance, never two entries.
#[async_trait]
pub trait Swarm: Send + Sync + 'static {
    /// The local node's own peer record.
    fn local_peer(&self) -> Peer;

    /// All peers the connection layer currently knows.
    fn known_peers(&self) -> Vec<Peer>;

    /// Idempotently register a peer, returning the canonical instance.
    fn register_peer(&self, peer: Peer) -> Peer;

    /// Open a stream to `peer` negotiated for `protocol_id`.
    async fn dial(&self, peer: &Peer, protocol_id: &str) -> Result<SwarmStream>;

    /// Subscribe to newly discovered peers. Dropping the receiver ends the
    /// subscription.
    fn subscribe_discovered(&self) -> broadcast::Receiver<Peer>;

    /// Register an inbound protocol handler under its protocol id.
    fn add_protocol(&self, handler: Arc<dyn ProtocolHandler>);

    /// Remove a previously registered protocol handler.
    fn remove_protocol(&self, protocol_id: &str);
}

/// An inbound stream handler the connection layer routes negotiated streams
/// to, keyed by protocol id.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn protocol_id(&self) -> &'static str;

    /// Handle one inbound stream opened by `remote`.
    async fn handle_stream(&self, remote: Peer, stream: SwarmStream) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Service
// ─────────────────────────────────────────────────────────────────────────────

struct RunningState {
    discovery_task: JoinHandle<()>,
}

/// The DHT protocol service.
///
/// A `Dht` owns a routing table and drives both lookup algorithms over the
/// [`Swarm`] it was built with. The type is generic over the connection layer
/// so tests can use an in-memory mock while production wires in a real
/// transport. Clones share all state, so a clone can be registered as the
/// inbound [`ProtocolHandler`] while the original keeps serving lookups.
///
/// # Key Methods
///
/// * [`start`](Self::start) / [`stop`](Self::stop) - lifecycle
/// * [`find_peer`](Self::find_peer) - locate a peer's record by identity
/// * [`find_providers`](Self::find_providers) - locate peers holding content
/// * [`process_message`](Self::process_message) - answer one inbound request
pub struct Dht<S: Swarm> {
    swarm: Arc<S>,
    routing: Arc<Mutex<RoutingTable>>,
    running: Arc<Mutex<Option<RunningState>>>,
}

impl<S: Swarm> Clone for Dht<S> {
    fn clone(&self) -> Self {
        Self {
            swarm: self.swarm.clone(),
            routing: self.routing.clone(),
            running: self.running.clone(),
        }
    }
}

impl<S: Swarm> Dht<S> {
    /// Create a stopped DHT service on top of the given connection layer.
    pub fn new(swarm: Arc<S>) -> Self {
        let local_id = swarm.local_peer().id;
        Self {
            swarm,
            routing: Arc::new(Mutex::new(RoutingTable::new(local_id))),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the service: seed a fresh routing table with the connection
    /// layer's known peers, register the protocol, and begin absorbing
    /// discovery notifications. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("dht already started");
            return;
        }

        {
            let mut routing = self.routing.lock().await;
            *routing = RoutingTable::new(self.swarm.local_peer().id);
            for peer in self.swarm.known_peers() {
                routing.add(peer);
            }
            debug!(peers = routing.len(), "dht started");
        }

        let mut discovered = self.swarm.subscribe_discovered();
        let routing = self.routing.clone();
        let discovery_task = tokio::spawn(async move {
            loop {
                match discovered.recv().await {
                    Ok(peer) => routing.lock().await.add(peer),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "discovery subscription lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.swarm.add_protocol(Arc::new(self.clone()));
        *running = Some(RunningState { discovery_task });
    }

    /// Stop the service: unregister the protocol, end the discovery
    /// subscription, and discard the routing table. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(state) = running.take() else {
            return;
        };
        self.swarm.remove_protocol(PROTOCOL_ID);
        state.discovery_task.abort();

        let mut routing = self.routing.lock().await;
        *routing = RoutingTable::new(self.swarm.local_peer().id);
        debug!("dht stopped");
    }

    /// Locate the peer with the given identity.
    ///
    /// Resolution order: the local node itself, then the connection layer's
    /// known-peer set (both without network activity), then a sequential
    /// probe of routing-table candidates in ascending distance order. Each
    /// candidate is asked `FindNode` for the target; every closer peer it
    /// returns is registered, and a registered peer matching the target ends
    /// the search. Per-candidate failures skip that candidate only.
    ///
    /// Fails with [`DhtError::NotFound`] once candidates are exhausted or
    /// `cancel` fires.
    pub async fn find_peer(
        &self,
        target: &PeerId,
        cancel: &CancellationToken,
    ) -> Result<Peer, DhtError> {
        let local = self.swarm.local_peer();
        if local.id == *target {
            return Ok(local);
        }
        if let Some(known) = self
            .swarm
            .known_peers()
            .into_iter()
            .find(|peer| peer.id == *target)
        {
            return Ok(known);
        }

        let request = DhtMessage::request(MessageType::FindNode, target.to_vec());
        let candidates = {
            let routing = self.routing.lock().await;
            routing.nearest_peers(target)
        };

        let mut found = None;
        for candidate in &candidates {
            if cancel.is_cancelled() {
                break;
            }

            let reply = match self.query_peer(candidate, &request).await {
                Ok(reply) => reply,
                Err(err) => {
                    debug!(peer = %short_id(&candidate.id), "find-node query yielded nothing: {err}");
                    continue;
                }
            };

            let closer = reply.closer_peers.as_deref().unwrap_or(&[]);
            for peer in self.register_peers(closer).await {
                if peer.id == *target {
                    found = Some(peer);
                }
            }
            // The whole response is drained into the routing table before the
            // search stops on a hit.
            if found.is_some() {
                break;
            }
        }

        found.ok_or(DhtError::NotFound)
    }

    /// Locate up to `limit` peers that can supply the content behind `key`.
    ///
    /// Runs bounded fan-out rounds: up to three unvisited nearest peers are
    /// queried concurrently, each exchange capped at five seconds and the
    /// round at ten; the round's results are merged only after every query in
    /// it has finished or failed. Closer peers become routing hints, provider
    /// peers are registered and collected with identity dedup. A failed or
    /// timed-out round never aborts the search.
    ///
    /// Returns fewer than `limit` peers when discovery is exhausted or
    /// `cancel` fires; neither is an error.
    pub async fn find_providers(
        &self,
        key: &Key,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Vec<Peer> {
        let mut visited: HashSet<PeerId> = HashSet::new();
        visited.insert(self.swarm.local_peer().id);
        let mut providers: Vec<Peer> = Vec::new();
        let request = DhtMessage::request(MessageType::GetProviders, key.to_vec());

        while providers.len() < limit && !cancel.is_cancelled() {
            let batch: Vec<Peer> = {
                let routing = self.routing.lock().await;
                routing
                    .nearest_peers(key)
                    .into_iter()
                    .filter(|peer| !visited.contains(&peer.id))
                    .take(ROUND_FANOUT)
                    .collect()
            };
            if batch.is_empty() {
                debug!(
                    providers = providers.len(),
                    "provider search exhausted all near peers"
                );
                break;
            }
            for peer in &batch {
                visited.insert(peer.id);
            }

            let round = timeout(
                ROUND_TIMEOUT,
                join_all(batch.iter().map(|peer| self.query_peer(peer, &request))),
            );
            let outcomes = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = round => match outcome {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        debug!("provider round exceeded its time budget; selecting next batch");
                        continue;
                    }
                },
            };

            for (peer, outcome) in batch.iter().zip(outcomes) {
                let reply = match outcome {
                    Ok(reply) => reply,
                    Err(err) => {
                        debug!(peer = %short_id(&peer.id), "provider query yielded nothing: {err}");
                        continue;
                    }
                };

                // Closer peers are routing hints, not providers.
                self.register_peers(reply.closer_peers.as_deref().unwrap_or(&[]))
                    .await;

                for provider in parse_descriptors(reply.provider_peers.as_deref().unwrap_or(&[])) {
                    let provider = self.swarm.register_peer(provider);
                    if providers.iter().all(|existing| existing.id != provider.id) {
                        providers.push(provider);
                    }
                }
            }
        }

        providers.truncate(limit);
        providers
    }

    /// Announce the local node as a provider for `key`.
    ///
    /// Advertising records is a future capability; every invocation fails
    /// with [`DhtError::Unimplemented`].
    pub async fn provide(&self, _key: &Key) -> Result<(), DhtError> {
        Err(DhtError::Unimplemented)
    }

    /// Answer one inbound request.
    ///
    /// A well-formed request always yields a well-formed response. `FindNode`
    /// and `GetProviders` are answered with the closer peers this node knows;
    /// `GetProviders` additionally carries an empty provider list since no
    /// provider records are kept. Every other kind receives an empty response
    /// echoing type and key. The sender is remembered as a live peer.
    pub async fn process_message(&self, from: &Peer, request: DhtMessage) -> DhtMessage {
        if from.id != self.swarm.local_peer().id {
            self.routing.lock().await.add(from.clone());
        }

        let closer_peers = match request.message_type {
            MessageType::FindNode | MessageType::GetProviders => {
                match Key::try_from(request.key.as_slice()) {
                    Ok(key) => {
                        let routing = self.routing.lock().await;
                        Some(
                            routing
                                .nearest_peers(&key)
                                .iter()
                                .filter(|peer| peer.id != from.id)
                                .map(PeerDescriptor::from)
                                .collect(),
                        )
                    }
                    // A key outside the metric space has no near peers.
                    Err(_) => Some(Vec::new()),
                }
            }
            _ => None,
        };
        let provider_peers = match request.message_type {
            MessageType::GetProviders => Some(Vec::new()),
            _ => None,
        };

        DhtMessage {
            message_type: request.message_type,
            key: request.key,
            closer_peers,
            provider_peers,
        }
    }

    /// One dial-plus-exchange with a peer, bounded by [`QUERY_TIMEOUT`].
    async fn query_peer(&self, peer: &Peer, request: &DhtMessage) -> Result<DhtMessage, DhtError> {
        let exchange = async {
            let mut stream = self
                .swarm
                .dial(peer, PROTOCOL_ID)
                .await
                .map_err(DhtError::ConnectionFailure)?;
            write_message(&mut stream, request).await?;
            read_message(&mut stream).await
        };
        match timeout(QUERY_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Register wire descriptors with the connection layer and the routing
    /// table, returning the canonical peers. Unparsable descriptors are
    /// skipped.
    async fn register_peers(&self, descriptors: &[PeerDescriptor]) -> Vec<Peer> {
        let parsed = parse_descriptors(descriptors);
        let mut registered = Vec::with_capacity(parsed.len());
        for peer in parsed {
            let peer = self.swarm.register_peer(peer);
            self.routing.lock().await.add(peer.clone());
            registered.push(peer);
        }
        registered
    }
}
