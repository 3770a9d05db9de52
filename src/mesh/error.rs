//! Error types for the mesh core

use thiserror::Error;

use super::registry::ConnectionState;
use super::types::PeerId;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Malformed signaling event: {0}")]
    Malformed(String),

    #[error("Cannot send {signal} to {target}")]
    InvalidTarget { signal: &'static str, target: String },

    #[error("Peer {peer} cannot go from {from} to {to}")]
    InvalidTransition {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Mesh task stopped")]
    Stopped,
}
