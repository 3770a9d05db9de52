//! Connection backend seams
//!
//! The negotiation engine talks to point-to-point connections only through
//! these traits. Backends report asynchronous notifications through
//! [`PeerEvents`], which feeds the mesh task's inbound queue.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use super::types::{IceCandidate, PeerId, SessionDescription};

/// Distinguishes successive connection attempts to the same peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Creates connection handles
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Construct a connection to `peer_id`. Every notification about it must
    /// go through `events`. Inbound data channels opened by the remote side
    /// must be adopted and reported like local ones.
    async fn connect(&self, peer_id: &PeerId, events: PeerEvents) -> Result<Arc<dyn PeerConnection>>;
}

/// ICE/SDP capable point-to-point connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open the local data channel, create an offer and set it as local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply a remote offer, create an answer and set it as local description
    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    /// Apply a remote answer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Ordered bidirectional message channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Ready state at call time
    fn is_open(&self) -> bool;

    async fn send(&self, payload: &Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Notification from a connection backend to the mesh task
pub(crate) enum MeshInput {
    LocalCandidate {
        peer_id: PeerId,
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    ChannelOpen {
        peer_id: PeerId,
        connection_id: ConnectionId,
        channel: Arc<dyn DataChannel>,
    },
    ChannelClosed {
        peer_id: PeerId,
        connection_id: ConnectionId,
    },
    ConnectionLost {
        peer_id: PeerId,
        connection_id: ConnectionId,
        reason: String,
    },
    Message {
        peer_id: PeerId,
        connection_id: ConnectionId,
        payload: Bytes,
    },
}

/// Notification sink handed to a backend for one connection.
///
/// Sending never blocks: callbacks fire while the mesh task may itself be
/// awaiting the same connection. Control notifications are never dropped;
/// data messages go through a bounded queue and are dropped when it is full.
#[derive(Clone)]
pub struct PeerEvents {
    peer_id: PeerId,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<MeshInput>,
    messages: mpsc::Sender<MeshInput>,
}

impl PeerEvents {
    pub(crate) fn new(
        peer_id: PeerId,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<MeshInput>,
        messages: mpsc::Sender<MeshInput>,
    ) -> Self {
        Self {
            peer_id,
            connection_id,
            tx,
            messages,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// A local network candidate was gathered
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.post(MeshInput::LocalCandidate {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            candidate,
        });
    }

    /// The data channel (local or adopted) became ready
    pub fn channel_open(&self, channel: Arc<dyn DataChannel>) {
        self.post(MeshInput::ChannelOpen {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            channel,
        });
    }

    pub fn channel_closed(&self) {
        self.post(MeshInput::ChannelClosed {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
        });
    }

    /// The underlying connection failed or was closed
    pub fn connection_lost(&self, reason: impl Into<String>) {
        self.post(MeshInput::ConnectionLost {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            reason: reason.into(),
        });
    }

    /// A message arrived on the data channel
    pub fn message(&self, payload: Bytes) {
        let input = MeshInput::Message {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id,
            payload,
        };
        match self.messages.try_send(input) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Message queue full, dropping message from {}", self.peer_id.short());
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Mesh stopped, dropping message from {}", self.peer_id.short());
            }
        }
    }

    fn post(&self, input: MeshInput) {
        if self.tx.send(input).is_err() {
            trace!("Mesh stopped, dropping notification for {}", self.peer_id.short());
        }
    }
}
