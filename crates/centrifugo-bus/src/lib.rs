//! Centrifugo bus client
//!
//! This crate provides both:
//! - A websocket subscription to one channel with automatic reconnect
//! - An HTTP publisher for the application server that relays into channels

mod client;
mod error;
pub mod protocol;
mod publisher;

pub use client::{spawn_subscription, Backoff, BusEvent, SubscriptionConfig, SubscriptionHandle};
pub use error::{BusError, Result};
pub use publisher::HttpPublisher;
