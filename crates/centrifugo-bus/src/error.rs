//! Error types for centrifugo-bus

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    #[error("Server rejected command {id}: {code} {message}")]
    Rejected { id: u32, code: u32, message: String },

    #[error("Connection closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
