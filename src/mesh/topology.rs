//! Mesh topology projection
//!
//! Each node only observes its own links, so when a peer opens we also draw
//! edges between it and every other open peer. The graph is derived from
//! registry transitions and never mutated on its own.

use serde::Serialize;
use std::collections::BTreeSet;

use super::types::PeerId;

/// Unordered pair of participants
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Edge {
    a: PeerId,
    b: PeerId,
}

impl Edge {
    pub fn new(x: PeerId, y: PeerId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    pub fn endpoints(&self) -> (&PeerId, &PeerId) {
        (&self.a, &self.b)
    }

    pub fn touches(&self, peer: &PeerId) -> bool {
        &self.a == peer || &self.b == peer
    }
}

/// Read-only view handed to renderers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologySnapshot {
    pub nodes: Vec<PeerId>,
    pub edges: Vec<Edge>,
}

impl TopologySnapshot {
    pub fn has_node(&self, peer: &PeerId) -> bool {
        self.nodes.contains(peer)
    }

    pub fn has_edge(&self, x: &PeerId, y: &PeerId) -> bool {
        self.edges.contains(&Edge::new(x.clone(), y.clone()))
    }
}

/// Graph of self plus open peers
#[derive(Debug, Clone)]
pub struct Topology {
    local: PeerId,
    nodes: BTreeSet<PeerId>,
    edges: BTreeSet<Edge>,
}

impl Topology {
    pub fn new(local: PeerId) -> Self {
        let mut nodes = BTreeSet::new();
        nodes.insert(local.clone());
        Self {
            local,
            nodes,
            edges: BTreeSet::new(),
        }
    }

    /// Record `peer` as open. `other_open` are the other currently open peers.
    /// Returns true if the graph changed.
    pub fn peer_opened<'a>(
        &mut self,
        peer: &PeerId,
        other_open: impl IntoIterator<Item = &'a PeerId>,
    ) -> bool {
        let mut changed = self.nodes.insert(peer.clone());
        changed |= self.add_edge(self.local.clone(), peer.clone());

        for other in other_open {
            if other == peer || other == &self.local {
                continue;
            }
            changed |= self.add_edge(other.clone(), peer.clone());
        }

        changed
    }

    /// Drop `peer` and every edge touching it. Returns true if the graph changed.
    pub fn peer_closed(&mut self, peer: &PeerId) -> bool {
        if peer == &self.local {
            return false;
        }
        let before = self.edges.len();
        self.edges.retain(|edge| !edge.touches(peer));
        let removed_node = self.nodes.remove(peer);
        removed_node || self.edges.len() != before
    }

    /// Insert an edge; an existing edge in either order suppresses the insert
    pub fn add_edge(&mut self, x: PeerId, y: PeerId) -> bool {
        if x == y {
            return false;
        }
        self.edges.insert(Edge::new(x, y))
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            nodes: self.nodes.iter().cloned().collect(),
            edges: self.edges.iter().cloned().collect(),
        }
    }
}
