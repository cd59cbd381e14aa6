#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::duplex;
use tokio::sync::broadcast;

use kad_dht::framing::{read_frame, write_frame};
use kad_dht::{
    Dht, DhtMessage, MessageType, Peer, PeerDescriptor, PeerId, ProtocolHandler, Swarm,
    SwarmStream,
};

/// What a mock peer does when it is dialed.
#[derive(Clone)]
pub enum DialScript {
    /// Read the request, answer with this message.
    Respond(DhtMessage),
    /// Read the request, wait, then answer with this message.
    Delay(Duration, DhtMessage),
    /// Read the request and never answer.
    Hang,
    /// Refuse the dial outright.
    Fail,
    /// Read the request, answer with raw bytes that are not a message.
    Garbage(Vec<u8>),
}

/// Routes dials between mock swarms so two real `Dht` nodes can talk to each
/// other through their actual inbound handlers.
#[derive(Default)]
pub struct SwarmRegistry {
    swarms: Mutex<HashMap<PeerId, Arc<MockSwarm>>>,
}

impl SwarmRegistry {
    fn register(&self, swarm: &Arc<MockSwarm>) {
        let mut swarms = self.swarms.lock().unwrap();
        swarms.insert(swarm.local_peer().id, swarm.clone());
    }

    fn get(&self, id: &PeerId) -> Option<Arc<MockSwarm>> {
        let swarms = self.swarms.lock().unwrap();
        swarms.get(id).cloned()
    }
}

/// In-memory connection layer. Dials resolve against per-peer scripts first,
/// then against live nodes in the shared registry; every exchange runs over a
/// real duplex stream so the framing and codec paths are exercised.
pub struct MockSwarm {
    local: Peer,
    registry: Arc<SwarmRegistry>,
    known: Mutex<HashMap<PeerId, Peer>>,
    scripts: Mutex<HashMap<PeerId, DialScript>>,
    protocols: Mutex<HashMap<String, Arc<dyn ProtocolHandler>>>,
    dials: Mutex<Vec<PeerId>>,
    discovered: broadcast::Sender<Peer>,
}

impl MockSwarm {
    pub fn new(registry: Arc<SwarmRegistry>, local: Peer) -> Arc<Self> {
        let (discovered, _) = broadcast::channel(32);
        let swarm = Arc::new(Self {
            local,
            registry: registry.clone(),
            known: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            protocols: Mutex::new(HashMap::new()),
            dials: Mutex::new(Vec::new()),
            discovered,
        });
        registry.register(&swarm);
        swarm
    }

    pub fn script(&self, id: PeerId, script: DialScript) {
        self.scripts.lock().unwrap().insert(id, script);
    }

    /// Identities dialed so far, in dial order.
    pub fn dials(&self) -> Vec<PeerId> {
        self.dials.lock().unwrap().clone()
    }

    pub fn protocol(&self, protocol_id: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.protocols.lock().unwrap().get(protocol_id).cloned()
    }

    /// Emit a discovery notification as the connection layer would.
    pub fn announce_discovered(&self, peer: Peer) {
        let _ = self.discovered.send(peer);
    }
}

/// Spawn a task playing the dialed peer's side of the exchange.
fn spawn_script(script: DialScript) -> SwarmStream {
    let (client, mut server) = duplex(64 * 1024);
    tokio::spawn(async move {
        let Ok(Some(_request)) = read_frame(&mut server).await else {
            return;
        };
        match script {
            DialScript::Respond(reply) => {
                let _ = write_frame(&mut server, &reply.encode().expect("encode reply")).await;
            }
            DialScript::Delay(wait, reply) => {
                tokio::time::sleep(wait).await;
                let _ = write_frame(&mut server, &reply.encode().expect("encode reply")).await;
            }
            DialScript::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            }
            DialScript::Garbage(bytes) => {
                let _ = write_frame(&mut server, &bytes).await;
            }
            DialScript::Fail => unreachable!("Fail is handled before a stream exists"),
        }
    });
    Box::new(client)
}

#[async_trait]
impl Swarm for MockSwarm {
    fn local_peer(&self) -> Peer {
        self.local.clone()
    }

    fn known_peers(&self) -> Vec<Peer> {
        self.known.lock().unwrap().values().cloned().collect()
    }

    fn register_peer(&self, peer: Peer) -> Peer {
        let mut known = self.known.lock().unwrap();
        known.entry(peer.id).or_insert(peer).clone()
    }

    async fn dial(&self, peer: &Peer, protocol_id: &str) -> Result<SwarmStream> {
        self.dials.lock().unwrap().push(peer.id);

        let script = self.scripts.lock().unwrap().get(&peer.id).cloned();
        match script {
            Some(DialScript::Fail) => Err(anyhow!("injected dial failure")),
            Some(script) => Ok(spawn_script(script)),
            None => {
                let target = self
                    .registry
                    .get(&peer.id)
                    .ok_or_else(|| anyhow!("no route to peer"))?;
                let handler = target
                    .protocol(protocol_id)
                    .ok_or_else(|| anyhow!("peer does not speak {protocol_id}"))?;
                let (client, server) = duplex(64 * 1024);
                let caller = self.local.clone();
                tokio::spawn(async move {
                    let _ = handler.handle_stream(caller, Box::new(server)).await;
                });
                Ok(Box::new(client))
            }
        }
    }

    fn subscribe_discovered(&self) -> broadcast::Receiver<Peer> {
        self.discovered.subscribe()
    }

    fn add_protocol(&self, handler: Arc<dyn ProtocolHandler>) {
        let mut protocols = self.protocols.lock().unwrap();
        protocols.insert(handler.protocol_id().to_string(), handler);
    }

    fn remove_protocol(&self, protocol_id: &str) {
        self.protocols.lock().unwrap().remove(protocol_id);
    }
}

pub fn make_peer_id(byte: u8) -> PeerId {
    let mut id = [0u8; 32];
    id[0] = byte;
    id
}

pub fn make_peer(byte: u8) -> Peer {
    Peer {
        id: make_peer_id(byte),
        addrs: vec![format!("/mock/{byte:#04x}")],
    }
}

/// Make `peers` lookup candidates by letting them appear as inbound
/// requesters, the same path a live sender takes into the routing table.
pub async fn seed_routing(dht: &Dht<MockSwarm>, peers: &[Peer]) {
    for peer in peers {
        dht.process_message(peer, DhtMessage::request(MessageType::Ping, Vec::new()))
            .await;
    }
}

/// A response carrying closer-peer hints.
pub fn closer_reply(key: &[u8], closer: &[Peer]) -> DhtMessage {
    DhtMessage {
        message_type: MessageType::FindNode,
        key: key.to_vec(),
        closer_peers: Some(closer.iter().map(PeerDescriptor::from).collect()),
        provider_peers: None,
    }
}

/// A response carrying provider peers and optional closer-peer hints.
pub fn provider_reply(key: &[u8], closer: &[Peer], providers: &[Peer]) -> DhtMessage {
    DhtMessage {
        message_type: MessageType::GetProviders,
        key: key.to_vec(),
        closer_peers: Some(closer.iter().map(PeerDescriptor::from).collect()),
        provider_peers: Some(providers.iter().map(PeerDescriptor::from).collect()),
    }
}
