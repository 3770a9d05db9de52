//! Signaling types compatible with the browser data-channel client

use serde::{Deserialize, Serialize};

use super::MeshError;

/// Participant identifier, unique per session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id, same shape as the browser's `crypto.randomUUID()`
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Personal bus channel of this participant
    pub fn channel(&self) -> String {
        format!("peer.{}", self.0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description as exchanged in `localDescription`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Inbound signaling event, demultiplexed from the personal channel
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    Offer { from: PeerId, sdp: SessionDescription },
    Answer { from: PeerId, sdp: SessionDescription },
    Candidate { from: PeerId, candidate: IceCandidate },
}

impl SignalingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEvent::PeerJoined { .. } => "peer.connected",
            SignalingEvent::PeerLeft { .. } => "peer.disconnected",
            SignalingEvent::Offer { .. } => "offer",
            SignalingEvent::Answer { .. } => "answer",
            SignalingEvent::Candidate { .. } => "ice",
        }
    }

    /// Remote participant the event is about
    pub fn peer_id(&self) -> &PeerId {
        match self {
            SignalingEvent::PeerJoined { peer_id } => peer_id,
            SignalingEvent::PeerLeft { peer_id } => peer_id,
            SignalingEvent::Offer { from, .. } => from,
            SignalingEvent::Answer { from, .. } => from,
            SignalingEvent::Candidate { from, .. } => from,
        }
    }
}

/// Publication body on `peer.<id>`, as sent by the signaling server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(
        rename = "localDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub local_description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl WireEvent {
    /// Decode into a signaling event for `local`.
    ///
    /// Returns `Ok(None)` for events addressed to somebody else.
    pub fn into_event(self, local: &PeerId) -> Result<Option<SignalingEvent>, MeshError> {
        if let Some(ref receiver) = self.receiver {
            if receiver != local.as_str() {
                return Ok(None);
            }
        }

        let id = self
            .id
            .map(PeerId::from)
            .ok_or_else(|| MeshError::Malformed(format!("{} without id", self.event)))?;

        let event = match self.event.as_str() {
            "peer.connected" => SignalingEvent::PeerJoined { peer_id: id },
            "peer.disconnected" => SignalingEvent::PeerLeft { peer_id: id },
            "offer" => SignalingEvent::Offer {
                from: id,
                sdp: self
                    .local_description
                    .ok_or_else(|| MeshError::Malformed("offer without localDescription".into()))?,
            },
            "answer" => SignalingEvent::Answer {
                from: id,
                sdp: self
                    .local_description
                    .ok_or_else(|| MeshError::Malformed("answer without localDescription".into()))?,
            },
            "ice" => SignalingEvent::Candidate {
                from: id,
                candidate: self
                    .candidate
                    .ok_or_else(|| MeshError::Malformed("ice without candidate".into()))?,
            },
            other => return Err(MeshError::Malformed(format!("unknown event {}", other))),
        };

        Ok(Some(event))
    }
}

/// Outbound signal
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    /// Announce this participant to the directory
    Join,
    /// Withdraw this participant from the directory
    Leave,
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::Candidate(_) => "ice",
            Signal::Join => "connect",
            Signal::Leave => "disconnect",
        }
    }
}

/// Where an outbound signal goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalTarget {
    Peer(PeerId),
    Broadcast,
}

impl std::fmt::Display for SignalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalTarget::Peer(id) => write!(f, "{}", id.short()),
            SignalTarget::Broadcast => write!(f, "directory"),
        }
    }
}

/// Which side of the offer/answer exchange this node plays for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Initiator => write!(f, "initiator"),
            PeerRole::Responder => write!(f, "responder"),
        }
    }
}

/// Lower id initiates, so each pair negotiates exactly once
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}
