//! Negotiation engine: the mesh task
//!
//! One task owns the registry and the topology. Signaling events, backend
//! notifications and application commands each arrive on their own queue and
//! are applied one at a time. Every handler re-checks that the entry (and its
//! connection id) still exists before acting, so late notifications about
//! peers that left or attempts that were abandoned are dropped.

use anyhow::Result;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionId, Connector, MeshInput, PeerConnection, PeerEvents};
use super::error::MeshError;
use super::fanout::{self, FanoutReport, MeshEvent};
use super::registry::{ConnectionState, MarkOpen, PeerStatus, Registry};
use super::signaling::{SignalChannel, SignalSender};
use super::topology::{Topology, TopologySnapshot};
use super::types::{
    should_initiate, IceCandidate, PeerId, PeerRole, SessionDescription, Signal, SignalTarget,
    SignalingEvent,
};

/// Queue sizes for the mesh task
#[derive(Debug, Clone)]
pub struct MeshOptions {
    /// Capacity of the application event queue
    pub event_buffer: usize,
    /// Capacity of the command queue
    pub command_buffer: usize,
    /// Inbound peer messages held before new ones are dropped
    pub message_buffer: usize,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            command_buffer: 64,
            message_buffer: 1024,
        }
    }
}

enum Command {
    Broadcast {
        payload: Bytes,
        reply: oneshot::Sender<FanoutReport>,
    },
    Statuses {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    Shutdown,
}

/// Application-side handle to a running mesh.
///
/// The mesh stops when [`MeshHandle::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct MeshHandle {
    local_id: PeerId,
    commands: mpsc::Sender<Command>,
    topology: watch::Receiver<TopologySnapshot>,
}

impl MeshHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Send `payload` to every peer whose channel is open
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> Result<FanoutReport, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Broadcast {
                payload: payload.into(),
                reply,
            })
            .await
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    pub async fn peer_statuses(&self) -> Result<Vec<PeerStatus>, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Statuses { reply })
            .await
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Latest topology snapshot
    pub fn topology(&self) -> TopologySnapshot {
        self.topology.borrow().clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Drives peer negotiation and owns all mesh state
pub struct MeshManager {
    local_id: PeerId,
    registry: Registry,
    topology: Topology,
    connector: Arc<dyn Connector>,
    signals: mpsc::Receiver<SignalingEvent>,
    sender: Arc<dyn SignalSender>,
    inputs_tx: mpsc::UnboundedSender<MeshInput>,
    inputs: mpsc::UnboundedReceiver<MeshInput>,
    messages_tx: mpsc::Sender<MeshInput>,
    messages: mpsc::Receiver<MeshInput>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<MeshEvent>,
    topology_tx: watch::Sender<TopologySnapshot>,
}

impl MeshManager {
    /// Create the mesh task. Returns the task, a handle and the application event stream.
    pub fn new(
        local_id: PeerId,
        signals: SignalChannel,
        connector: Arc<dyn Connector>,
        options: MeshOptions,
    ) -> (Self, MeshHandle, mpsc::Receiver<MeshEvent>) {
        let topology = Topology::new(local_id.clone());
        let (topology_tx, topology_rx) = watch::channel(topology.snapshot());
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (messages_tx, messages) = mpsc::channel(options.message_buffer.max(1));
        let (command_tx, commands) = mpsc::channel(options.command_buffer.max(1));
        let (events_tx, events) = mpsc::channel(options.event_buffer.max(1));

        let manager = Self {
            local_id: local_id.clone(),
            registry: Registry::new(),
            topology,
            connector,
            signals: signals.events,
            sender: signals.sender,
            inputs_tx,
            inputs,
            messages_tx,
            messages,
            commands,
            events: events_tx,
            topology_tx,
        };

        let handle = MeshHandle {
            local_id,
            commands: command_tx,
            topology: topology_rx,
        };

        (manager, handle, events)
    }

    /// Run until shutdown, then tear the mesh down
    pub async fn run(mut self) -> Result<()> {
        info!("Starting mesh as {}", self.local_id);
        self.publish_topology();

        let mut signals_open = true;
        loop {
            tokio::select! {
                biased;

                Some(input) = self.inputs.recv() => {
                    self.handle_input(input).await;
                }
                event = self.signals.recv(), if signals_open => {
                    match event {
                        Some(event) => self.handle_signal(event).await,
                        None => {
                            warn!("Signal transport closed, no new peers will be negotiated");
                            signals_open = false;
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Broadcast { payload, reply }) => {
                            let report = fanout::broadcast(self.registry.open_peers(), &payload).await;
                            let _ = reply.send(report);
                        }
                        Some(Command::Statuses { reply }) => {
                            let _ = reply.send(self.registry.statuses());
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                // Data last, so a chatty peer cannot starve negotiation
                Some(input) = self.messages.recv() => {
                    self.handle_input(input).await;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Single dispatch point for inbound signaling
    async fn handle_signal(&mut self, event: SignalingEvent) {
        if event.peer_id() == &self.local_id {
            trace!("Ignoring {} about ourselves", event.kind());
            return;
        }

        debug!("Received {} from {}", event.kind(), event.peer_id().short());

        match event {
            SignalingEvent::PeerJoined { peer_id } => self.peer_joined(peer_id).await,
            SignalingEvent::PeerLeft { peer_id } => self.peer_left(&peer_id).await,
            SignalingEvent::Offer { from, sdp } => self.offer_received(from, sdp).await,
            SignalingEvent::Answer { from, sdp } => self.answer_received(&from, sdp).await,
            SignalingEvent::Candidate { from, candidate } => {
                self.candidate_received(&from, candidate).await
            }
        }
    }

    /// Single dispatch point for backend notifications
    async fn handle_input(&mut self, input: MeshInput) {
        match input {
            MeshInput::LocalCandidate {
                peer_id,
                connection_id,
                candidate,
            } => {
                if !self.is_current(&peer_id, connection_id) {
                    trace!("Dropping local candidate for stale connection to {}", peer_id.short());
                    return;
                }
                self.send_signal(SignalTarget::Peer(peer_id), Signal::Candidate(candidate))
                    .await;
            }
            MeshInput::ChannelOpen {
                peer_id,
                connection_id,
                channel,
            } => {
                if self.registry.mark_open(&peer_id, connection_id, channel) != MarkOpen::Opened {
                    return;
                }
                info!("Peer {} connected", peer_id.short());
                let others = self.registry.open_peer_ids_except(&peer_id);
                if self.topology.peer_opened(&peer_id, &others) {
                    self.publish_topology();
                }
            }
            MeshInput::ChannelClosed {
                peer_id,
                connection_id,
            } => {
                self.connection_ended(&peer_id, connection_id, "data channel closed")
                    .await;
            }
            MeshInput::ConnectionLost {
                peer_id,
                connection_id,
                reason,
            } => {
                self.connection_ended(&peer_id, connection_id, &reason).await;
            }
            MeshInput::Message {
                peer_id,
                connection_id,
                payload,
            } => {
                if !self.is_current(&peer_id, connection_id) {
                    trace!("Dropping message from stale connection to {}", peer_id.short());
                    return;
                }
                fanout::deliver(&self.events, peer_id, payload);
            }
        }
    }

    /// Initiator path
    async fn peer_joined(&mut self, peer_id: PeerId) {
        let initiate = should_initiate(&self.local_id, &peer_id);
        info!("Discovered peer: {} (initiate: {})", peer_id.short(), initiate);
        if !initiate {
            return;
        }

        let Some((connection, connection_id)) = self.create_entry(&peer_id, PeerRole::Initiator).await
        else {
            return;
        };

        match connection.create_offer().await {
            Ok(offer) => {
                self.send_signal(SignalTarget::Peer(peer_id.clone()), Signal::Offer(offer))
                    .await;
                info!("Sent offer to {}", peer_id.short());
            }
            Err(e) => self.abandon(&peer_id, connection_id, e).await,
        }
    }

    /// Responder path
    async fn offer_received(&mut self, from: PeerId, offer: SessionDescription) {
        info!("Received offer from {}", from.short());

        if let Some(entry) = self.registry.get(&from) {
            let ours_wins = entry.role() == PeerRole::Initiator
                && entry.state() == ConnectionState::Negotiating
                && should_initiate(&self.local_id, &from);
            if ours_wins {
                debug!("Offer collision with {}, keeping our own offer", from.short());
                return;
            }
            debug!(
                "Replacing {} {} entry for {} with a fresh answer",
                entry.state(),
                entry.role(),
                from.short()
            );
            self.remove_peer(&from).await;
        }

        let Some((connection, connection_id)) = self.create_entry(&from, PeerRole::Responder).await
        else {
            return;
        };

        match connection.create_answer(offer).await {
            Ok(answer) => {
                self.send_signal(SignalTarget::Peer(from.clone()), Signal::Answer(answer))
                    .await;
                info!("Sent answer to {}", from.short());
            }
            Err(e) => self.abandon(&from, connection_id, e).await,
        }
    }

    async fn answer_received(&mut self, from: &PeerId, answer: SessionDescription) {
        let Some(entry) = self.registry.get(from) else {
            debug!("Answer from unknown peer {}, dropping", from.short());
            return;
        };
        if entry.role() != PeerRole::Initiator || entry.state() != ConnectionState::Negotiating {
            debug!(
                "Unexpected answer from {} ({} {}), dropping",
                from.short(),
                entry.state(),
                entry.role()
            );
            return;
        }

        let connection = entry.connection().clone();
        let connection_id = entry.connection_id();
        match connection.apply_answer(answer).await {
            Ok(()) => info!("Applied answer from {}", from.short()),
            Err(e) => self.abandon(from, connection_id, e).await,
        }
    }

    async fn candidate_received(&mut self, from: &PeerId, candidate: IceCandidate) {
        // Early candidates are dropped, not buffered
        let Some(entry) = self.registry.get(from) else {
            debug!("Candidate from unknown peer {}, dropping", from.short());
            return;
        };

        let connection = entry.connection().clone();
        if let Err(e) = connection.add_candidate(candidate).await {
            debug!("Failed to add candidate from {}: {:#}", from.short(), e);
        }
    }

    async fn peer_left(&mut self, peer_id: &PeerId) {
        if self.remove_peer(peer_id).await {
            info!("Peer {} left", peer_id.short());
        } else {
            debug!("Peer {} left without an entry", peer_id.short());
        }
    }

    async fn create_entry(
        &mut self,
        peer_id: &PeerId,
        role: PeerRole,
    ) -> Option<(Arc<dyn PeerConnection>, ConnectionId)> {
        let connector = self.connector.clone();
        let inputs_tx = self.inputs_tx.clone();
        let messages_tx = self.messages_tx.clone();
        let result = self
            .registry
            .upsert(peer_id, role, |connection_id| {
                let events = PeerEvents::new(peer_id.clone(), connection_id, inputs_tx, messages_tx);
                let peer_id = peer_id.clone();
                async move { connector.connect(&peer_id, events).await }
            })
            .await;

        match result {
            Ok((entry, true)) => Some((entry.connection().clone(), entry.connection_id())),
            Ok((entry, false)) => {
                debug!(
                    "Already have {} {} entry for {}",
                    entry.state(),
                    entry.role(),
                    peer_id.short()
                );
                None
            }
            Err(e) => {
                warn!("Failed to create connection for {}: {:#}", peer_id.short(), e);
                None
            }
        }
    }

    async fn connection_ended(&mut self, peer_id: &PeerId, connection_id: ConnectionId, reason: &str) {
        if self.registry.remove_connection(peer_id, connection_id).await {
            info!("Peer {} disconnected: {}", peer_id.short(), reason);
            if self.topology.peer_closed(peer_id) {
                self.publish_topology();
            }
        }
    }

    /// Give up on a negotiation attempt; a later join or offer starts over
    async fn abandon(&mut self, peer_id: &PeerId, connection_id: ConnectionId, error: anyhow::Error) {
        warn!("Negotiation with {} failed: {:#}", peer_id.short(), error);
        if self.registry.remove_connection(peer_id, connection_id).await
            && self.topology.peer_closed(peer_id)
        {
            self.publish_topology();
        }
    }

    async fn remove_peer(&mut self, peer_id: &PeerId) -> bool {
        let removed = self.registry.remove(peer_id).await;
        if removed && self.topology.peer_closed(peer_id) {
            self.publish_topology();
        }
        removed
    }

    fn is_current(&self, peer_id: &PeerId, connection_id: ConnectionId) -> bool {
        self.registry
            .get(peer_id)
            .map(|entry| entry.connection_id() == connection_id)
            .unwrap_or(false)
    }

    /// Sends are awaited in order, so a peer sees our offer before our candidates
    async fn send_signal(&self, target: SignalTarget, signal: Signal) {
        trace!("Sending {} to {}", signal.kind(), target);
        if let Err(e) = self.sender.send(target, signal).await {
            warn!("{:#}", e);
        }
    }

    /// The watch always holds the latest snapshot; the event is best effort
    fn publish_topology(&self) {
        let snapshot = self.topology.snapshot();
        self.topology_tx.send_replace(snapshot.clone());
        match self.events.try_send(MeshEvent::TopologyChanged(snapshot)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Event queue full, topology change only visible through the handle");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Application receiver dropped, topology not delivered");
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Mesh shutting down, closing {} peer(s)", self.registry.len());

        let mut changed = false;
        for peer_id in self.registry.drain().await {
            changed |= self.topology.peer_closed(&peer_id);
        }
        if changed {
            self.publish_topology();
        }

        self.send_signal(SignalTarget::Broadcast, Signal::Leave).await;
    }
}
