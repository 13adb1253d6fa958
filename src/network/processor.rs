//! Request processing on the worker pool
//!
//! A job decodes one chunk with its own codec, works out the reply, stores
//! it in the connection's pending slot and asks the owning dispatch loop to
//! arm write interest.

use crate::handshake::{ConnectionCache, Responder};
use crate::network::buffer_pool::PooledBuffer;
use crate::network::connection::{PeerSlot, Reply};
use crate::network::error::NodeError;
use crate::network::registry::LoopHandle;
use crate::network::worker_pool::WorkerPool;
use crate::protocol::{peer_key, Command, Envelope, EnvelopeCodec, NetworkType};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

/// State shared by every job of every loop
#[derive(Debug)]
pub struct ProcessorContext {
    pub network: NetworkType,
    pub responder: Responder,
    pub cache: Arc<ConnectionCache>,
}

impl ProcessorContext {
    pub fn new(network: NetworkType, responder: Responder) -> Self {
        let cache = Arc::clone(responder.cache());
        Self {
            network,
            responder,
            cache,
        }
    }
}

/// Builds replies for one dispatch loop
#[derive(Clone)]
pub struct RequestProcessor {
    context: Arc<ProcessorContext>,
    owner: LoopHandle,
}

impl RequestProcessor {
    pub fn new(context: Arc<ProcessorContext>, owner: LoopHandle) -> Self {
        Self { context, owner }
    }

    pub fn context(&self) -> &Arc<ProcessorContext> {
        &self.context
    }

    /// Queue `chunk` for processing on `pool`
    pub fn submit(&self, pool: &WorkerPool, slot: Arc<PeerSlot>, chunk: PooledBuffer) -> Result<(), NodeError> {
        let processor = self.clone();
        pool.execute(move || {
            if let Err(e) = processor.process(&slot, &chunk) {
                log::warn!("Request from {} failed: {}", slot.peer(), e);
            }
            // Always report back so the loop can settle interest and close
            // half-closed peers that got no reply.
            if let Err(e) = processor.owner.request_write(slot.token()) {
                log::warn!("Failed to notify loop {}: {}", processor.owner.index(), e);
            }
        })
    }

    /// Decode the first envelope of `chunk` and queue the reply, if any;
    /// returns the command seen. Envelopes after the first are not read.
    pub fn process(&self, slot: &PeerSlot, chunk: &[u8]) -> Result<Command, NodeError> {
        let mut codec = EnvelopeCodec::new(self.context.network);
        let envelope = codec.parse(&mut Cursor::new(chunk));
        let command = envelope.kind();
        log::debug!("{} from {}", command, slot.peer());

        if let Some(reply) = self.reply_for(slot.peer(), &envelope)? {
            slot.offer(reply)
                .map_err(|_| NodeError::ReplyPending(slot.peer().to_string()))?;
        }
        Ok(command)
    }

    /// Reply owed for `envelope`, `None` when the command needs no answer
    pub fn reply_for(&self, peer: SocketAddr, envelope: &Envelope) -> Result<Option<Reply>, NodeError> {
        let network = self.context.network;
        match envelope.kind() {
            Command::Ping => {
                let pong = Envelope::new(network, Command::Pong.as_str(), envelope.payload().clone());
                Ok(Some(Reply::Single(pong.to_bytes())))
            }
            Command::Pong | Command::Verack | Command::SendHeaders => Ok(None),
            Command::Version => Ok(Some(Reply::HandshakeBundle(
                self.context.responder.bundle_for(peer, envelope),
            ))),
            Command::Error | Command::Unknown(_) => Ok(Some(Reply::Single(envelope.to_bytes()))),
            command if command.requires_handshake() && !self.context.cache.is_cached(&peer_key(&peer)) => {
                log::info!("Ignoring {} from {}: no completed handshake", command, peer);
                Ok(None)
            }
            command => Err(NodeError::UnhandledCommand(command.to_string())),
        }
    }
}
