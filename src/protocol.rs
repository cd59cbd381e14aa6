//! DHT wire message definitions and codec.
//!
//! One [`DhtMessage`] envelope carries a request or a response: a message
//! type, a target key, and (on responses) optional lists of closer peers and
//! provider peers. Messages are serialized with serde and travel inside the
//! length-prefixed frames of [`crate::framing`], so a reader on a shared
//! stream always knows how many bytes the next message occupies.
//!
//! The absent-vs-empty distinction of the two peer lists is preserved on the
//! wire: `None` and `Some(vec![])` round-trip as different values.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::core::{Peer, PeerId};
use crate::error::DhtError;
use crate::framing::{read_frame, write_frame};

/// Protocol name advertised to peers.
pub const PROTOCOL_NAME: &str = "ipfs/kad";
/// Protocol version advertised to peers.
pub const PROTOCOL_VERSION: &str = "1.0";
/// Full protocol identifier used when dialing and when registering with the
/// connection layer.
pub const PROTOCOL_ID: &str = "/ipfs/kad/1.0";

/// Query kinds of the protocol family.
///
/// Only `FindNode` and `GetProviders` are issued by this node; the remaining
/// kinds are decodable and receive a well-formed empty response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

/// Wire form of a peer: identity bytes plus address hints.
///
/// A descriptor whose id is not a valid [`PeerId`] cannot be converted into a
/// [`Peer`]; receivers skip such entries instead of failing the exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: Vec<u8>,
    pub addrs: Vec<String>,
}

impl From<&Peer> for PeerDescriptor {
    fn from(peer: &Peer) -> Self {
        Self {
            id: peer.id.to_vec(),
            addrs: peer.addrs.clone(),
        }
    }
}

impl TryFrom<&PeerDescriptor> for Peer {
    type Error = DhtError;

    fn try_from(descriptor: &PeerDescriptor) -> Result<Self, Self::Error> {
        let id = PeerId::try_from(descriptor.id.as_slice()).map_err(|_| {
            DhtError::MalformedMessage(format!(
                "peer descriptor id has {} bytes, expected {}",
                descriptor.id.len(),
                std::mem::size_of::<PeerId>()
            ))
        })?;
        Ok(Peer {
            id,
            addrs: descriptor.addrs.clone(),
        })
    }
}

/// The envelope for one request or one response.
///
/// Immutable once constructed; a lookup builds one request per logical query
/// and reuses it unmodified across every peer it asks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtMessage {
    pub message_type: MessageType,
    pub key: Vec<u8>,
    pub closer_peers: Option<Vec<PeerDescriptor>>,
    pub provider_peers: Option<Vec<PeerDescriptor>>,
}

impl DhtMessage {
    /// Build a request envelope. Requests never carry peer lists.
    pub fn request(message_type: MessageType, key: Vec<u8>) -> Self {
        Self {
            message_type,
            key,
            closer_peers: None,
            provider_peers: None,
        }
    }

    /// Serialize this message into frame payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        serde_json::to_vec(self).map_err(|err| DhtError::MalformedMessage(err.to_string()))
    }

    /// Deserialize a message from frame payload bytes.
    ///
    /// Truncated or otherwise malformed input fails with
    /// [`DhtError::MalformedMessage`]; it never panics.
    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        serde_json::from_slice(bytes).map_err(|err| DhtError::MalformedMessage(err.to_string()))
    }
}

/// Write one message as a length-prefixed frame.
pub async fn write_message<W>(stream: &mut W, message: &DhtMessage) -> Result<(), DhtError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    write_frame(stream, &bytes)
        .await
        .map_err(DhtError::ConnectionFailure)
}

/// Read one length-prefixed message frame.
///
/// A stream that closes before delivering a frame counts as a malformed
/// exchange: the peer accepted the request but never answered it.
pub async fn read_message<R>(stream: &mut R) -> Result<DhtMessage, DhtError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(stream)
        .await
        .map_err(DhtError::ConnectionFailure)?
        .ok_or_else(|| {
            DhtError::MalformedMessage("stream closed before a response frame".into())
        })?;
    DhtMessage::decode(&frame)
}

/// Convert wire descriptors into peers, skipping entries that fail to parse.
pub fn parse_descriptors(descriptors: &[PeerDescriptor]) -> Vec<Peer> {
    let mut peers = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        match Peer::try_from(descriptor) {
            Ok(peer) => peers.push(peer),
            Err(err) => debug!("skipping peer descriptor: {err}"),
        }
    }
    peers
}
