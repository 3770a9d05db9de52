//! Signal transport adapter over the Centrifugo bus
//!
//! Inbound: publications on `peer.<local id>` become [`SignalingEvent`]s.
//! Outbound: signals are POSTed to the signaling server, which relays them
//! into the receiver's personal channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use centrifugo_bus::{spawn_subscription, BusEvent, HttpPublisher, SubscriptionConfig, SubscriptionHandle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::MeshError;
use super::types::{
    IceCandidate, PeerId, SessionDescription, Signal, SignalTarget, SignalingEvent, WireEvent,
};

/// Best-effort publish of outbound signals
#[async_trait]
pub trait SignalSender: Send + Sync + 'static {
    async fn send(&self, target: SignalTarget, signal: Signal) -> Result<()>;
}

/// Both directions of the signaling transport
pub struct SignalChannel {
    /// Inbound events addressed to the local participant
    pub events: mpsc::Receiver<SignalingEvent>,
    pub sender: Arc<dyn SignalSender>,
}

#[derive(Serialize)]
struct DescriptionBody<'a> {
    receiver: &'a str,
    id: &'a str,
    #[serde(rename = "localDescription")]
    local_description: &'a SessionDescription,
}

#[derive(Serialize)]
struct CandidateBody<'a> {
    receiver: &'a str,
    id: &'a str,
    candidate: &'a IceCandidate,
}

#[derive(Serialize)]
struct PresenceBody<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
}

/// HTTP request for a signal: path and JSON body
pub fn encode_signal(
    local: &PeerId,
    target: &SignalTarget,
    signal: &Signal,
) -> Result<(&'static str, serde_json::Value), MeshError> {
    let invalid = || MeshError::InvalidTarget {
        signal: signal.kind(),
        target: target.to_string(),
    };

    let encoded = match (signal, target) {
        (Signal::Offer(sdp), SignalTarget::Peer(peer)) => (
            "/offer",
            serde_json::to_value(DescriptionBody {
                receiver: peer.as_str(),
                id: local.as_str(),
                local_description: sdp,
            }),
        ),
        (Signal::Answer(sdp), SignalTarget::Peer(peer)) => (
            "/answer",
            serde_json::to_value(DescriptionBody {
                receiver: peer.as_str(),
                id: local.as_str(),
                local_description: sdp,
            }),
        ),
        (Signal::Candidate(candidate), SignalTarget::Peer(peer)) => (
            "/ice",
            serde_json::to_value(CandidateBody {
                receiver: peer.as_str(),
                id: local.as_str(),
                candidate,
            }),
        ),
        (Signal::Join, SignalTarget::Broadcast) => (
            "/connect",
            serde_json::to_value(PresenceBody {
                client_id: local.as_str(),
            }),
        ),
        (Signal::Leave, SignalTarget::Broadcast) => (
            "/disconnect",
            serde_json::to_value(PresenceBody {
                client_id: local.as_str(),
            }),
        ),
        _ => return Err(invalid()),
    };

    let (path, body) = encoded;
    let body = body.map_err(|e| MeshError::Malformed(e.to_string()))?;
    Ok((path, body))
}

/// Decode a publication body addressed to `local`.
///
/// Returns `None` (after logging) for anything the mesh should not see.
pub fn decode_publication(local: &PeerId, data: serde_json::Value) -> Option<SignalingEvent> {
    let wire: WireEvent = match serde_json::from_value(data) {
        Ok(wire) => wire,
        Err(e) => {
            debug!("Undecodable publication: {}", e);
            return None;
        }
    };

    match wire.into_event(local) {
        Ok(Some(event)) if event.peer_id() == local => {
            debug!("Ignoring {} about ourselves", event.kind());
            None
        }
        Ok(Some(event)) => Some(event),
        Ok(None) => {
            debug!("Ignoring publication for another receiver");
            None
        }
        Err(e) => {
            debug!("{}", e);
            None
        }
    }
}

/// Sends signals to the signaling server over HTTP
pub struct HttpSignalSender {
    publisher: HttpPublisher,
    local: PeerId,
}

impl HttpSignalSender {
    pub fn new(publisher: HttpPublisher, local: PeerId) -> Self {
        Self { publisher, local }
    }
}

#[async_trait]
impl SignalSender for HttpSignalSender {
    async fn send(&self, target: SignalTarget, signal: Signal) -> Result<()> {
        let (path, body) = encode_signal(&self.local, &target, &signal)?;
        self.publisher
            .post(path, &body)
            .await
            .with_context(|| format!("Failed to send {} to {}", signal.kind(), target))?;
        debug!("Sent {} to {}", signal.kind(), target);
        Ok(())
    }
}

/// Settings for [`connect_centrifugo`]
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub server_url: String,
    pub websocket_url: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub buffer: usize,
}

/// Running bus adapter; dropping it stops the subscription
pub struct BusHandle {
    subscription_shutdown: mpsc::Sender<()>,
}

impl BusHandle {
    pub async fn shutdown(&self) {
        let _ = self.subscription_shutdown.send(()).await;
    }
}

/// Fetch a token, subscribe to the personal channel and start the adapter task.
///
/// The adapter announces `Join` every time the subscription (re)connects.
pub async fn connect_centrifugo(
    settings: &BusSettings,
    local: &PeerId,
) -> Result<(SignalChannel, BusHandle)> {
    let publisher = HttpPublisher::new(&settings.server_url);
    let token = publisher
        .fetch_token(local.as_str())
        .await
        .context("Failed to fetch bus token")?;

    let subscription = spawn_subscription(
        SubscriptionConfig {
            websocket_url: settings.websocket_url.clone(),
            token: Some(token),
            name: Some("peermesh".to_string()),
            channel: local.channel(),
            reconnect_min: settings.reconnect_min,
            reconnect_max: settings.reconnect_max,
        },
        settings.buffer,
    );

    let sender: Arc<dyn SignalSender> = Arc::new(HttpSignalSender::new(publisher, local.clone()));
    let (event_tx, events) = mpsc::channel(settings.buffer);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(run_adapter(
        local.clone(),
        subscription,
        event_tx,
        sender.clone(),
        shutdown_rx,
    ));

    Ok((
        SignalChannel { events, sender },
        BusHandle {
            subscription_shutdown: shutdown_tx,
        },
    ))
}

async fn run_adapter(
    local: PeerId,
    mut subscription: SubscriptionHandle,
    event_tx: mpsc::Sender<SignalingEvent>,
    sender: Arc<dyn SignalSender>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                subscription.shutdown();
                break;
            }
            event = subscription.events.recv() => {
                let Some(event) = event else {
                    warn!("Bus subscription ended");
                    break;
                };
                match event {
                    BusEvent::Connected { client } => {
                        info!("Bus connected (client {}), announcing {}", client, local.short());
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sender.send(SignalTarget::Broadcast, Signal::Join).await {
                                warn!("{:#}", e);
                            }
                        });
                    }
                    BusEvent::Disconnected { reason } => {
                        warn!("Bus disconnected: {}", reason);
                    }
                    BusEvent::Publication { data, .. } => {
                        if let Some(signal) = decode_publication(&local, data) {
                            if event_tx.send(signal).await.is_err() {
                                subscription.shutdown();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}
