//! Websocket subscription to a single Centrifugo channel
//!
//! The subscription runs in its own task, reconnecting with exponential
//! backoff until shut down. Everything it sees is reported as a [`BusEvent`].

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::error::{BusError, Result};
use crate::protocol::{self, Command, CONNECT_ID, SUBSCRIBE_ID};

/// Subscription settings
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Websocket endpoint, e.g. `ws://localhost:8000/connection/websocket`
    pub websocket_url: String,
    /// Connection token (JWT) issued by the application server
    pub token: Option<String>,
    /// Client name reported to the server
    pub name: Option<String>,
    /// Channel to subscribe to
    pub channel: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

/// Events reported by a running subscription
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Connected and subscribed (sent again after every reconnect)
    Connected { client: String },
    /// Publication received on the subscribed channel
    Publication { channel: String, data: Value },
    /// Session lost; a reconnect follows unless shutting down
    Disconnected { reason: String },
}

/// Handle to a running subscription task
pub struct SubscriptionHandle {
    pub events: mpsc::Receiver<BusEvent>,
    shutdown: watch::Sender<bool>,
}

impl SubscriptionHandle {
    /// Stop the subscription task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Exponential reconnect delay with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, without jitter
    pub fn base_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.min.saturating_mul(factor).min(self.max)
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        (base + Duration::from_millis(jitter_ms)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Spawn a subscription task
pub fn spawn_subscription(config: SubscriptionConfig, buffer: usize) -> SubscriptionHandle {
    let (event_tx, events) = mpsc::channel(buffer);
    let (shutdown, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_subscription(config, event_tx, shutdown_rx));

    SubscriptionHandle { events, shutdown }
}

async fn run_subscription(
    config: SubscriptionConfig,
    event_tx: mpsc::Sender<BusEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.reconnect_min, config.reconnect_max);

    loop {
        let reason = match session(&config, &event_tx, &mut shutdown_rx, &mut backoff).await {
            Ok(()) => {
                info!("Subscription to {} stopped", config.channel);
                return;
            }
            Err(e) => e.to_string(),
        };

        error!("Bus session for {} ended: {}", config.channel, reason);
        if event_tx.send(BusEvent::Disconnected { reason }).await.is_err() {
            return;
        }

        let delay = backoff.next_delay();
        debug!("Reconnecting to {} in {:?}", config.websocket_url, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// One websocket session. Returns Ok on shutdown, Err when the session breaks.
async fn session(
    config: &SubscriptionConfig,
    event_tx: &mpsc::Sender<BusEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
    backoff: &mut Backoff,
) -> Result<()> {
    info!("Connecting to bus: {}", config.websocket_url);

    let (ws_stream, _) = connect_async(config.websocket_url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    let connect = Command::connect(config.token.clone(), config.name.clone());
    write
        .send(Message::Text(serde_json::to_string(&connect)?.into()))
        .await?;
    let subscribe = Command::subscribe(&config.channel);
    write
        .send(Message::Text(serde_json::to_string(&subscribe)?.into()))
        .await?;

    let mut answer_pings = false;
    let mut client = String::new();

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        return Err(BusError::Closed(reason));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(BusError::Closed("stream ended".to_string())),
                };

                trace!("Bus frame: {}", text.as_str());

                for reply in protocol::parse_frame(text.as_str())? {
                    if reply.is_ping() {
                        if answer_pings {
                            write.send(Message::Text(protocol::pong().into())).await?;
                        }
                        continue;
                    }

                    if let Some(err) = reply.error {
                        if reply.id == CONNECT_ID || reply.id == SUBSCRIBE_ID {
                            return Err(BusError::Rejected {
                                id: reply.id,
                                code: err.code,
                                message: err.message,
                            });
                        }
                        warn!("Bus error reply {}: {} {}", reply.id, err.code, err.message);
                        continue;
                    }

                    if let Some(result) = reply.connect {
                        answer_pings = result.pong;
                        client = result.client;
                        debug!("Bus connected as client {} (server {})", client, result.version);
                    }

                    if reply.id == SUBSCRIBE_ID && reply.subscribe.is_some() {
                        info!("Subscribed to {}", config.channel);
                        backoff.reset();
                        if event_tx.send(BusEvent::Connected { client: client.clone() }).await.is_err() {
                            return Ok(());
                        }
                    }

                    if let Some(push) = reply.push {
                        if push.disconnect.is_some() {
                            return Err(BusError::Closed("server disconnect push".to_string()));
                        }
                        if let Some(publication) = push.publication {
                            let event = BusEvent::Publication {
                                channel: push.channel,
                                data: publication.data,
                            };
                            if event_tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(backoff.base_delay(), Duration::from_millis(100));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));

        assert_eq!(backoff.base_delay(), Duration::from_millis(200));
        backoff.next_delay();
        assert_eq!(backoff.base_delay(), Duration::from_millis(400));

        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_secs(1));
        }
        assert_eq!(backoff.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.base_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_max_below_min() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(backoff.base_delay(), Duration::from_secs(2));
    }
}
