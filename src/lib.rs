//! # kad-dht
//!
//! A Kademlia-style distributed hash table module for a node in a peer
//! network. It answers two questions: where does the peer with a given
//! identity live, and which peers can supply the content behind a given
//! content hash. Peers are tracked in an XOR-metric routing table and
//! queries resolve iteratively by asking progressively closer peers.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: identity space and distance metric, the [`RoutingTable`], the
//!   connection-layer seam ([`Swarm`], [`ProtocolHandler`]), and the [`Dht`]
//!   service with both lookup algorithms.
//! - [`protocol`]: the serializable wire messages exchanged between peers and
//!   their codec.
//! - [`framing`]: helpers for length-prefixed frames so exchanges can share a
//!   single stream without framing ambiguity.
//! - [`server`]: the inbound request/response handler registered with the
//!   connection layer.
//! - [`error`]: the [`DhtError`] kinds surfaced by DHT operations.
//!
//! ## Getting started
//!
//! The connection layer (dialing, peer registry, discovery events) stays
//! behind the [`Swarm`] trait. Wrap yours, build a [`Dht`], start it, and
//! drive lookups:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kad_dht::{Dht, Swarm};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn launch<S: Swarm>(swarm: Arc<S>) -> Result<(), kad_dht::DhtError> {
//! let dht = Dht::new(swarm);
//! dht.start().await;
//!
//! let cancel = CancellationToken::new();
//! let peer = dht.find_peer(&kad_dht::derive_peer_id(b"who"), &cancel).await?;
//! let providers = dht
//!     .find_providers(&kad_dht::hash_content(b"what"), 20, &cancel)
//!     .await;
//! # let _ = (peer, providers);
//! # Ok(())
//! # }
//! ```
//!
//! Lookups degrade gracefully: slow, unreachable, or misbehaving peers cost
//! results, never the whole search.

pub mod core;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod server;

pub use self::core::{
    derive_peer_id, hash_content, xor_distance, Dht, Key, Peer, PeerId, PeerStream,
    ProtocolHandler, RoutingTable, Swarm, SwarmStream,
};
pub use self::error::DhtError;
pub use self::protocol::{
    DhtMessage, MessageType, PeerDescriptor, PROTOCOL_ID, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use self::server::handle_stream;
