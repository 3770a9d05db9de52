//! Centrifugo bidirectional JSON protocol frames
//!
//! Only the subset a subscriber needs: connect, subscribe, pushed publications
//! and server pings. A single websocket frame may carry several replies
//! separated by newlines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command id used for the connect request
pub const CONNECT_ID: u32 = 1;

/// Command id used for the subscribe request
pub const SUBSCRIBE_ID: u32 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub channel: String,
}

impl Command {
    pub fn connect(token: Option<String>, name: Option<String>) -> Self {
        Self {
            id: CONNECT_ID,
            connect: Some(ConnectRequest { token, name }),
            subscribe: None,
        }
    }

    pub fn subscribe(channel: &str) -> Self {
        Self {
            id: SUBSCRIBE_ID,
            connect: None,
            subscribe: Some(SubscribeRequest {
                channel: channel.to_string(),
            }),
        }
    }
}

/// A reply or push received from the server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub error: Option<ReplyError>,
    #[serde(default)]
    pub connect: Option<ConnectResult>,
    #[serde(default)]
    pub subscribe: Option<Value>,
    #[serde(default)]
    pub push: Option<Push>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub version: String,
    /// Server expects a pong for every ping
    #[serde(default)]
    pub pong: bool,
    /// Ping interval in seconds
    #[serde(default)]
    pub ping: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Push {
    #[serde(default)]
    pub channel: String,
    #[serde(rename = "pub", default)]
    pub publication: Option<Publication>,
    #[serde(default)]
    pub disconnect: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Publication {
    pub data: Value,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl Reply {
    /// A bare `{}` is a server ping
    pub fn is_ping(&self) -> bool {
        self.id == 0
            && self.error.is_none()
            && self.connect.is_none()
            && self.subscribe.is_none()
            && self.push.is_none()
    }
}

/// Split a websocket text frame into replies
pub fn parse_frame(text: &str) -> Result<Vec<Reply>, serde_json::Error> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Encoded pong frame
pub fn pong() -> String {
    "{}".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_command_format() {
        let cmd = Command::connect(Some("jwt".to_string()), Some("peermesh".to_string()));
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"id":1,"connect":{"token":"jwt","name":"peermesh"}}"#);
    }

    #[test]
    fn test_subscribe_command_format() {
        let cmd = Command::subscribe("peer.abc");
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"id":2,"subscribe":{"channel":"peer.abc"}}"#);
    }

    #[test]
    fn test_parse_multi_reply_frame() {
        let frame = "{\"id\":1,\"connect\":{\"client\":\"c1\",\"version\":\"5.0.0\",\"pong\":true,\"ping\":25}}\n{\"id\":2,\"subscribe\":{}}";
        let replies = parse_frame(frame).unwrap();
        assert_eq!(replies.len(), 2);

        let connect = replies[0].connect.as_ref().unwrap();
        assert_eq!(connect.client, "c1");
        assert!(connect.pong);
        assert_eq!(replies[1].id, SUBSCRIBE_ID);
        assert!(replies[1].subscribe.is_some());
    }

    #[test]
    fn test_parse_ping() {
        let replies = parse_frame("{}").unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ping());
    }

    #[test]
    fn test_parse_publication_push() {
        let frame = r#"{"push":{"channel":"peer.me","pub":{"data":{"event":"peer.connected","id":"other"},"offset":3}}}"#;
        let replies = parse_frame(frame).unwrap();
        let push = replies[0].push.as_ref().unwrap();
        assert_eq!(push.channel, "peer.me");

        let publication = push.publication.as_ref().unwrap();
        assert_eq!(publication.data["event"], "peer.connected");
        assert_eq!(publication.offset, Some(3));
        assert!(!replies[0].is_ping());
    }

    #[test]
    fn test_parse_error_reply() {
        let replies = parse_frame(r#"{"id":1,"error":{"code":109,"message":"token expired"}}"#).unwrap();
        let err = replies[0].error.as_ref().unwrap();
        assert_eq!(err.code, 109);
        assert_eq!(err.message, "token expired");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_frame("not json").is_err());
    }
}
