//! Peer mesh over WebRTC data channels
//!
//! Participants discover each other through a Centrifugo signaling bus
//! (personal channel `peer.<id>`), negotiate one connection per pair and
//! broadcast opaque payloads to every open peer:
//! - Inbound events: peer.connected, peer.disconnected, offer, answer, ice
//! - Outbound: POST /offer, /answer, /ice, /connect, /disconnect
//! - Lower id initiates

mod connection;
mod error;
mod fanout;
mod negotiation;
mod peer;
mod registry;
mod signaling;
mod topology;
mod types;

#[cfg(test)]
mod tests;

pub use connection::{ConnectionId, Connector, DataChannel, PeerConnection, PeerEvents};
pub use error::MeshError;
pub use fanout::{FanoutReport, MeshEvent};
pub use negotiation::{MeshHandle, MeshManager, MeshOptions};
pub use peer::{RtcChannel, RtcConnection, RtcConnector, RtcSettings};
pub use registry::{ConnectionState, PeerStatus};
pub use signaling::{
    connect_centrifugo, decode_publication, encode_signal, BusHandle, BusSettings,
    HttpSignalSender, SignalChannel, SignalSender,
};
pub use topology::{Edge, TopologySnapshot};
pub use types::{
    should_initiate, IceCandidate, PeerId, PeerRole, SdpKind, SessionDescription, Signal,
    SignalTarget, SignalingEvent, WireEvent,
};
