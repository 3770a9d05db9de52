//! Message fan-out over open data channels

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use super::connection::DataChannel;
use super::topology::TopologySnapshot;
use super::types::PeerId;

/// Events delivered to the application layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    TopologyChanged(TopologySnapshot),
    Message { from: PeerId, payload: Bytes },
}

/// Per-peer outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: Vec<PeerId>,
    /// Channel closed between snapshot and write
    pub skipped: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

impl FanoutReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

enum Outcome {
    Delivered,
    Skipped,
    Failed,
}

/// Write `payload` to every channel in the snapshot that is still open.
///
/// Writes run concurrently; a closed or failing channel never holds up the others.
pub async fn broadcast(peers: Vec<(PeerId, Arc<dyn DataChannel>)>, payload: &Bytes) -> FanoutReport {
    let writes = peers.into_iter().map(|(peer_id, channel)| async move {
        if !channel.is_open() {
            trace!("Channel to {} closed, skipping", peer_id.short());
            return (peer_id, Outcome::Skipped);
        }
        match channel.send(payload).await {
            Ok(()) => (peer_id, Outcome::Delivered),
            Err(e) => {
                warn!("Failed to send to {}: {}", peer_id.short(), e);
                (peer_id, Outcome::Failed)
            }
        }
    });

    let mut report = FanoutReport::default();
    for (peer_id, outcome) in join_all(writes).await {
        match outcome {
            Outcome::Delivered => report.delivered.push(peer_id),
            Outcome::Skipped => report.skipped.push(peer_id),
            Outcome::Failed => report.failed.push(peer_id),
        }
    }

    debug!(
        "Broadcast {} bytes: {} delivered, {} skipped, {} failed",
        payload.len(),
        report.delivered.len(),
        report.skipped.len(),
        report.failed.len()
    );
    report
}

/// Hand an inbound payload to the application unchanged.
///
/// Never waits on the application: a full queue drops the message.
pub fn deliver(events: &mpsc::Sender<MeshEvent>, from: PeerId, payload: Bytes) {
    trace!("Message from {}: {} bytes", from.short(), payload.len());
    match events.try_send(MeshEvent::Message { from, payload }) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            if let MeshEvent::Message { from, .. } = event {
                warn!("Application event queue full, dropping message from {}", from.short());
            }
        }
        Err(TrySendError::Closed(_)) => {
            debug!("Application receiver dropped, discarding message");
        }
    }
}
