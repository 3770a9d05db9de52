//! Peer connection registry: the single source of truth for mesh membership

use anyhow::Result;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::connection::{ConnectionId, DataChannel, PeerConnection};
use super::error::MeshError;
use super::types::{PeerId, PeerRole};

/// Connection state for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Open,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Negotiating => write!(f, "negotiating"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Peer entry in the registry
pub struct PeerEntry {
    peer_id: PeerId,
    role: PeerRole,
    connection_id: ConnectionId,
    state: ConnectionState,
    connection: Arc<dyn PeerConnection>,
    channel: Option<Arc<dyn DataChannel>>,
    created_at: Instant,
    opened_at: Option<Instant>,
}

impl PeerEntry {
    pub fn new(
        peer_id: PeerId,
        role: PeerRole,
        connection_id: ConnectionId,
        connection: Arc<dyn PeerConnection>,
    ) -> Self {
        Self {
            peer_id,
            role,
            connection_id,
            state: ConnectionState::Negotiating,
            connection,
            channel: None,
            created_at: Instant::now(),
            opened_at: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Attach the ready channel. Only valid from `Negotiating`.
    pub fn open(&mut self, channel: Arc<dyn DataChannel>) -> Result<(), MeshError> {
        if self.state != ConnectionState::Negotiating {
            return Err(MeshError::InvalidTransition {
                peer: self.peer_id.clone(),
                from: self.state,
                to: ConnectionState::Open,
            });
        }
        self.state = ConnectionState::Open;
        self.channel = Some(channel);
        self.opened_at = Some(Instant::now());
        Ok(())
    }

    /// Move to the terminal state, detaching the channel
    pub fn close(&mut self) -> Option<Arc<dyn DataChannel>> {
        self.state = ConnectionState::Closed;
        self.channel.take()
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.peer_id.clone(),
            role: self.role,
            state: self.state,
            connection_id: self.connection_id,
            age: self.created_at.elapsed(),
            open_for: self.opened_at.map(|t| t.elapsed()),
        }
    }
}

/// Diagnostic view of one entry
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub role: PeerRole,
    pub state: ConnectionState,
    pub connection_id: ConnectionId,
    pub age: Duration,
    pub open_for: Option<Duration>,
}

/// Outcome of [`Registry::mark_open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOpen {
    Opened,
    /// No entry for the peer (removed in the meantime)
    Absent,
    /// Notification from an abandoned connection attempt
    Stale,
    /// Entry exists but is not negotiating
    Ignored,
}

/// Mapping from peer id to connection state
#[derive(Default)]
pub struct Registry {
    peers: HashMap<PeerId, PeerEntry>,
    next_connection_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `peer_id`, creating it with a fresh connection if absent.
    ///
    /// `connect` runs only when the entry is created. The bool is true for a new entry.
    pub async fn upsert<F, Fut>(
        &mut self,
        peer_id: &PeerId,
        role: PeerRole,
        connect: F,
    ) -> Result<(&mut PeerEntry, bool)>
    where
        F: FnOnce(ConnectionId) -> Fut,
        Fut: Future<Output = Result<Arc<dyn PeerConnection>>>,
    {
        match self.peers.entry(peer_id.clone()) {
            Entry::Occupied(occupied) => Ok((occupied.into_mut(), false)),
            Entry::Vacant(vacant) => {
                self.next_connection_id += 1;
                let connection_id = ConnectionId(self.next_connection_id);
                let connection = connect(connection_id).await?;
                debug!(
                    "Registered {} ({}, {})",
                    peer_id.short(),
                    role,
                    connection_id
                );
                let entry = PeerEntry::new(peer_id.clone(), role, connection_id, connection);
                Ok((vacant.insert(entry), true))
            }
        }
    }

    /// Transition the entry to `Open` with its channel
    pub fn mark_open(
        &mut self,
        peer_id: &PeerId,
        connection_id: ConnectionId,
        channel: Arc<dyn DataChannel>,
    ) -> MarkOpen {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            debug!("Channel open for unknown peer {}, ignoring", peer_id.short());
            return MarkOpen::Absent;
        };

        if entry.connection_id != connection_id {
            debug!(
                "Channel open for {} from stale connection {} (current {})",
                peer_id.short(),
                connection_id,
                entry.connection_id
            );
            return MarkOpen::Stale;
        }

        match entry.open(channel) {
            Ok(()) => MarkOpen::Opened,
            Err(e) => {
                debug!("{}", e);
                MarkOpen::Ignored
            }
        }
    }

    /// Close and discard the entry's handles. Returns false if there was no entry.
    pub async fn remove(&mut self, peer_id: &PeerId) -> bool {
        match self.peers.remove(peer_id) {
            Some(entry) => {
                Self::teardown(entry).await;
                true
            }
            None => false,
        }
    }

    /// Remove only if the entry still belongs to `connection_id`
    pub async fn remove_connection(&mut self, peer_id: &PeerId, connection_id: ConnectionId) -> bool {
        match self.peers.get(peer_id) {
            Some(entry) if entry.connection_id == connection_id => self.remove(peer_id).await,
            Some(_) => {
                debug!("Ignoring close of stale connection {} for {}", connection_id, peer_id.short());
                false
            }
            None => false,
        }
    }

    /// Remove and close every entry
    pub async fn drain(&mut self) -> Vec<PeerId> {
        let entries: Vec<PeerEntry> = self.peers.drain().map(|(_, entry)| entry).collect();
        let mut removed = Vec::with_capacity(entries.len());
        for entry in entries {
            removed.push(entry.peer_id.clone());
            Self::teardown(entry).await;
        }
        removed
    }

    async fn teardown(mut entry: PeerEntry) {
        if let Some(channel) = entry.close() {
            if let Err(e) = channel.close().await {
                debug!("Error closing channel to {}: {}", entry.peer_id.short(), e);
            }
        }
        if let Err(e) = entry.connection.close().await {
            warn!("Error closing connection to {}: {}", entry.peer_id.short(), e);
        }
        debug!("Removed {} ({})", entry.peer_id.short(), entry.connection_id);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    #[cfg(test)]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of open peers and their channels, as of now
    pub fn open_peers(&self) -> Vec<(PeerId, Arc<dyn DataChannel>)> {
        self.peers
            .values()
            .filter(|entry| entry.is_open())
            .filter_map(|entry| Some((entry.peer_id().clone(), entry.channel()?.clone())))
            .collect()
    }

    /// Ids of open peers other than `except`
    pub fn open_peer_ids_except(&self, except: &PeerId) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|entry| entry.is_open() && entry.peer_id() != except)
            .map(|entry| entry.peer_id().clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<PeerStatus> {
        let mut statuses: Vec<PeerStatus> = self.peers.values().map(PeerEntry::status).collect();
        statuses.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::types::{IceCandidate, SessionDescription};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct NullConnection {
        closed: AtomicBool,
    }

    #[async_trait]
    impl PeerConnection for NullConnection {
        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0"))
        }
        async fn create_answer(&self, _offer: SessionDescription) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0"))
        }
        async fn apply_answer(&self, _answer: SessionDescription) -> Result<()> {
            Ok(())
        }
        async fn add_candidate(&self, _candidate: IceCandidate) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullChannel {
        open: AtomicBool,
    }

    impl NullChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl DataChannel for NullChannel {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn send(&self, _payload: &Bytes) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn insert(registry: &mut Registry, id: &str) -> (ConnectionId, Arc<NullConnection>) {
        let conn = Arc::new(NullConnection::default());
        let handle = conn.clone();
        let (entry, created) = registry
            .upsert(&PeerId::from(id), PeerRole::Initiator, |_| async move {
                Ok(handle as Arc<dyn PeerConnection>)
            })
            .await
            .unwrap();
        assert!(created);
        (entry.connection_id(), conn)
    }

    fn assert_channel_invariant(registry: &Registry) {
        for status in registry.statuses() {
            let entry = registry.get(&status.peer_id).unwrap();
            assert_eq!(entry.channel().is_some(), entry.state() == ConnectionState::Open);
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let mut registry = Registry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let peer = PeerId::from("p1");

        for _ in 0..2 {
            let calls = calls.clone();
            registry
                .upsert(&peer, PeerRole::Initiator, |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullConnection::default()) as Arc<dyn PeerConnection>)
                })
                .await
                .unwrap();
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.get(&peer).unwrap().state(), ConnectionState::Negotiating);
    }

    #[tokio::test]
    async fn test_upsert_connect_failure_creates_nothing() {
        let mut registry = Registry::new();
        let result = registry
            .upsert(&PeerId::from("p1"), PeerRole::Responder, |_| async {
                Err::<Arc<dyn PeerConnection>, _>(anyhow::anyhow!("no ICE"))
            })
            .await;

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mark_open_attaches_channel() {
        let mut registry = Registry::new();
        let (conn_id, _) = insert(&mut registry, "p1").await;
        let peer = PeerId::from("p1");

        assert_channel_invariant(&registry);
        assert_eq!(registry.mark_open(&peer, conn_id, NullChannel::new()), MarkOpen::Opened);
        assert_channel_invariant(&registry);

        let entry = registry.get(&peer).unwrap();
        assert!(entry.is_open());
        assert_eq!(registry.open_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_open_absent_and_stale() {
        let mut registry = Registry::new();
        let peer = PeerId::from("p1");

        assert_eq!(
            registry.mark_open(&peer, ConnectionId(1), NullChannel::new()),
            MarkOpen::Absent
        );

        let (conn_id, _) = insert(&mut registry, "p1").await;
        let stale = ConnectionId(conn_id.0 + 100);
        assert_eq!(registry.mark_open(&peer, stale, NullChannel::new()), MarkOpen::Stale);
        assert!(!registry.get(&peer).unwrap().is_open());

        assert_eq!(registry.mark_open(&peer, conn_id, NullChannel::new()), MarkOpen::Opened);
        assert_eq!(registry.mark_open(&peer, conn_id, NullChannel::new()), MarkOpen::Ignored);
    }

    #[tokio::test]
    async fn test_remove_closes_handles() {
        let mut registry = Registry::new();
        let (conn_id, conn) = insert(&mut registry, "p1").await;
        let peer = PeerId::from("p1");
        let channel = NullChannel::new();
        registry.mark_open(&peer, conn_id, channel.clone());

        assert!(registry.remove(&peer).await);
        assert!(!registry.remove(&peer).await);
        assert!(registry.is_empty());
        assert!(conn.closed.load(Ordering::SeqCst));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_remove_connection_ignores_stale() {
        let mut registry = Registry::new();
        let (conn_id, _) = insert(&mut registry, "p1").await;
        let peer = PeerId::from("p1");

        assert!(!registry.remove_connection(&peer, ConnectionId(conn_id.0 + 1)).await);
        assert!(registry.contains(&peer));
        assert!(registry.remove_connection(&peer, conn_id).await);
        assert!(!registry.contains(&peer));
    }

    #[tokio::test]
    async fn test_fresh_attempt_gets_new_connection_id() {
        let mut registry = Registry::new();
        let (first, _) = insert(&mut registry, "p1").await;
        registry.remove(&PeerId::from("p1")).await;
        let (second, _) = insert(&mut registry, "p1").await;
        assert_ne!(first, second);
    }

    #[test]
    fn test_closed_entry_never_reopens() {
        let mut entry = PeerEntry::new(
            PeerId::from("p1"),
            PeerRole::Initiator,
            ConnectionId(1),
            Arc::new(NullConnection::default()),
        );
        entry.open(NullChannel::new()).unwrap();
        assert!(entry.close().is_some());
        assert_eq!(entry.state(), ConnectionState::Closed);
        assert!(entry.channel().is_none());

        let err = entry.open(NullChannel::new()).unwrap_err();
        assert!(matches!(
            err,
            MeshError::InvalidTransition {
                from: ConnectionState::Closed,
                to: ConnectionState::Open,
                ..
            }
        ));
        assert_eq!(entry.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_open_peers_is_a_snapshot() {
        let mut registry = Registry::new();
        let (a, _) = insert(&mut registry, "a").await;
        insert(&mut registry, "b").await;
        registry.mark_open(&PeerId::from("a"), a, NullChannel::new());

        let snapshot = registry.open_peers();
        registry.remove(&PeerId::from("a")).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, PeerId::from("a"));
        assert!(registry.open_peers().is_empty());
        assert_eq!(
            registry.open_peer_ids_except(&PeerId::from("b")),
            Vec::<PeerId>::new()
        );
    }

    #[tokio::test]
    async fn test_drain_removes_everything() {
        let mut registry = Registry::new();
        let (_, c1) = insert(&mut registry, "a").await;
        let (_, c2) = insert(&mut registry, "b").await;

        let mut removed = registry.drain().await;
        removed.sort();
        assert_eq!(removed, vec![PeerId::from("a"), PeerId::from("b")]);
        assert!(registry.is_empty());
        assert!(c1.closed.load(Ordering::SeqCst));
        assert!(c2.closed.load(Ordering::SeqCst));
    }
}
