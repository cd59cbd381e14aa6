//! Inbound side of the protocol: one request/response exchange per stream.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::core::{short_id, Dht, Peer, ProtocolHandler, Swarm, SwarmStream};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{DhtMessage, PROTOCOL_ID};

/// Serve a single inbound stream negotiated for [`PROTOCOL_ID`].
///
/// The connection layer invokes this for every stream a peer opens with our
/// protocol id. The exchange is one request frame answered by one response
/// frame; a well-formed request never leaves the peer hanging. A frame that
/// does not decode marks the stream as corrupt, so it is dropped without a
/// reply rather than answered with guesses.
pub async fn handle_stream<S: Swarm>(
    dht: &Dht<S>,
    remote: Peer,
    mut stream: SwarmStream,
) -> Result<()> {
    let Some(bytes) = read_frame(&mut stream).await? else {
        // Peer opened the stream and closed it without asking anything.
        return Ok(());
    };

    let request = match DhtMessage::decode(&bytes) {
        Ok(request) => request,
        Err(err) => {
            debug!(peer = %short_id(&remote.id), "dropping undecodable request: {err}");
            return Ok(());
        }
    };

    let reply = dht.process_message(&remote, request).await;
    write_frame(&mut stream, &reply.encode()?).await?;
    Ok(())
}

#[async_trait]
impl<S: Swarm> ProtocolHandler for Dht<S> {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    async fn handle_stream(&self, remote: Peer, stream: SwarmStream) -> Result<()> {
        handle_stream(self, remote, stream).await
    }
}
