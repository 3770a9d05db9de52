//! WebRTC connection backend built on webrtc-rs

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::connection::{Connector, DataChannel, PeerConnection, PeerEvents};
use super::types::{IceCandidate, PeerId, SdpKind, SessionDescription};

/// Settings for WebRTC connections
#[derive(Debug, Clone)]
pub struct RtcSettings {
    /// STUN servers for NAT traversal
    pub stun_servers: Vec<String>,
    /// Label of the data channel created by the initiator
    pub channel_label: String,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.stunprotocol.org:3478".to_string()],
            channel_label: "dataChannel".to_string(),
        }
    }
}

/// Creates webrtc-rs peer connections
pub struct RtcConnector {
    settings: RtcSettings,
}

impl RtcConnector {
    pub fn new(settings: RtcSettings) -> Self {
        Self { settings }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .settings
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Arc::new(api.new_peer_connection(config).await?))
    }
}

#[async_trait]
impl Connector for RtcConnector {
    async fn connect(&self, peer_id: &PeerId, events: PeerEvents) -> Result<Arc<dyn PeerConnection>> {
        let pc = self.new_peer_connection().await?;

        // Trickle local candidates to the peer
        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => events.local_candidate(from_rtc_candidate(init)),
                        Err(e) => debug!("Unserializable local candidate: {}", e),
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!("Peer {} connection state: {:?}", events.peer_id().short(), state);
                match state {
                    RTCPeerConnectionState::Failed => events.connection_lost("connection failed"),
                    RTCPeerConnectionState::Closed => events.connection_lost("connection closed"),
                    _ => {}
                }
            })
        }));

        // Adopt channels opened by the remote side
        let adopt_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = adopt_events.clone();
            Box::pin(async move {
                info!("Peer {} opened data channel '{}'", events.peer_id().short(), dc.label());
                wire_channel(dc, events);
            })
        }));

        debug!("Created peer connection for {}", peer_id.short());

        Ok(Arc::new(RtcConnection {
            pc,
            label: self.settings.channel_label.clone(),
            events,
            local_channel: Mutex::new(None),
        }))
    }
}

/// Route a data channel's notifications into the mesh
fn wire_channel(dc: Arc<RTCDataChannel>, events: PeerEvents) {
    let open_dc = dc.clone();
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!("[Peer {}] Data channel '{}' open", open_events.peer_id().short(), open_dc.label());
            open_events.channel_open(Arc::new(RtcChannel { dc: open_dc }));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            info!("[Peer {}] Data channel closed", events.peer_id().short());
            events.channel_closed();
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            trace!("[Peer {}] Received {} bytes", events.peer_id().short(), msg.data.len());
            events.message(msg.data);
        })
    }));
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

/// webrtc-rs peer connection
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    label: String,
    events: PeerEvents,
    local_channel: Mutex<Option<Arc<RTCDataChannel>>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let dc = self.pc.create_data_channel(&self.label, None).await?;
        wire_channel(dc.clone(), self.events.clone());
        *self.local_channel.lock().await = Some(dc);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != SdpKind::Offer {
            anyhow::bail!("Expected offer, got {:?}", offer.kind);
        }
        self.pc.set_remote_description(to_rtc_description(offer)?).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            anyhow::bail!("Expected answer, got {:?}", answer.kind);
        }
        self.pc.set_remote_description(to_rtc_description(answer)?).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }
        self.pc.add_ice_candidate(to_rtc_candidate(candidate)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(dc) = self.local_channel.lock().await.take() {
            dc.close().await?;
        }
        self.pc.close().await?;
        Ok(())
    }
}

/// webrtc-rs data channel
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: &Bytes) -> Result<()> {
        match std::str::from_utf8(payload) {
            // Browsers display text frames; keep text as text
            Ok(text) => self.dc.send_text(text.to_string()).await?,
            Err(_) => self.dc.send(payload).await?,
        };
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}
