//! Tests for signaling wire compatibility with the browser client

use super::signaling::{decode_publication, encode_signal};
use super::types::*;
use super::MeshError;

fn local() -> PeerId {
    PeerId::from("local-uuid")
}

#[test]
fn test_parse_peer_connected() {
    // Directory announcement, no receiver field
    let data = serde_json::json!({"event": "peer.connected", "id": "remote-uuid"});
    let event = decode_publication(&local(), data).unwrap();
    assert_eq!(
        event,
        SignalingEvent::PeerJoined {
            peer_id: PeerId::from("remote-uuid")
        }
    );
    assert_eq!(event.kind(), "peer.connected");
}

#[test]
fn test_parse_peer_disconnected() {
    let data = serde_json::json!({"event": "peer.disconnected", "id": "remote-uuid"});
    let event = decode_publication(&local(), data).unwrap();
    assert_eq!(event.kind(), "peer.disconnected");
    assert_eq!(event.peer_id(), &PeerId::from("remote-uuid"));
}

#[test]
fn test_parse_browser_offer() {
    let raw = r#"{"event":"offer","id":"remote-uuid","receiver":"local-uuid","localDescription":{"type":"offer","sdp":"v=0\r\n"}}"#;
    let data: serde_json::Value = serde_json::from_str(raw).unwrap();
    match decode_publication(&local(), data).unwrap() {
        SignalingEvent::Offer { from, sdp } => {
            assert_eq!(from.as_str(), "remote-uuid");
            assert_eq!(sdp.kind, SdpKind::Offer);
            assert_eq!(sdp.sdp, "v=0\r\n");
        }
        other => panic!("Expected offer, got {:?}", other),
    }
}

#[test]
fn test_parse_browser_answer() {
    let raw = r#"{"event":"answer","id":"remote-uuid","receiver":"local-uuid","localDescription":{"type":"answer","sdp":"v=0\r\n"}}"#;
    let data: serde_json::Value = serde_json::from_str(raw).unwrap();
    let event = decode_publication(&local(), data).unwrap();
    assert_eq!(
        event,
        SignalingEvent::Answer {
            from: PeerId::from("remote-uuid"),
            sdp: SessionDescription::answer("v=0\r\n"),
        }
    );
}

#[test]
fn test_parse_browser_candidate() {
    let raw = r#"{"event":"ice","id":"remote-uuid","receiver":"local-uuid","candidate":{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
    let data: serde_json::Value = serde_json::from_str(raw).unwrap();
    match decode_publication(&local(), data).unwrap() {
        SignalingEvent::Candidate { from, candidate } => {
            assert_eq!(from.as_str(), "remote-uuid");
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            assert_eq!(candidate.sdp_mline_index, Some(0));
            assert_eq!(candidate.username_fragment, None);
        }
        other => panic!("Expected candidate, got {:?}", other),
    }
}

#[test]
fn test_other_receiver_is_dropped() {
    let data = serde_json::json!({
        "event": "offer",
        "id": "remote-uuid",
        "receiver": "someone-else",
        "localDescription": {"type": "offer", "sdp": "v=0"}
    });
    assert!(decode_publication(&local(), data).is_none());
}

#[test]
fn test_events_about_ourselves_are_dropped() {
    let data = serde_json::json!({"event": "peer.connected", "id": "local-uuid"});
    assert!(decode_publication(&local(), data).is_none());
}

#[test]
fn test_malformed_events() {
    let wire: WireEvent = serde_json::from_value(serde_json::json!({
        "event": "offer",
        "id": "remote-uuid"
    }))
    .unwrap();
    assert!(matches!(wire.into_event(&local()), Err(MeshError::Malformed(_))));

    let wire: WireEvent =
        serde_json::from_value(serde_json::json!({"event": "peer.connected"})).unwrap();
    assert!(matches!(wire.into_event(&local()), Err(MeshError::Malformed(_))));

    let wire: WireEvent =
        serde_json::from_value(serde_json::json!({"event": "renegotiate", "id": "x"})).unwrap();
    assert!(matches!(wire.into_event(&local()), Err(MeshError::Malformed(_))));

    assert!(decode_publication(&local(), serde_json::json!("not an object")).is_none());
}

#[test]
fn test_encode_offer() {
    let target = SignalTarget::Peer(PeerId::from("remote-uuid"));
    let signal = Signal::Offer(SessionDescription::offer("v=0"));
    let (path, body) = encode_signal(&local(), &target, &signal).unwrap();

    assert_eq!(path, "/offer");
    assert_eq!(
        body,
        serde_json::json!({
            "receiver": "remote-uuid",
            "id": "local-uuid",
            "localDescription": {"type": "offer", "sdp": "v=0"}
        })
    );
}

#[test]
fn test_encode_answer() {
    let target = SignalTarget::Peer(PeerId::from("remote-uuid"));
    let signal = Signal::Answer(SessionDescription::answer("v=0"));
    let (path, body) = encode_signal(&local(), &target, &signal).unwrap();

    assert_eq!(path, "/answer");
    assert_eq!(body["localDescription"]["type"], "answer");
    assert_eq!(body["receiver"], "remote-uuid");
}

#[test]
fn test_encode_candidate() {
    let target = SignalTarget::Peer(PeerId::from("remote-uuid"));
    let signal = Signal::Candidate(IceCandidate {
        candidate: "candidate:1 1 UDP 1 10.0.0.1 9 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    });
    let (path, body) = encode_signal(&local(), &target, &signal).unwrap();

    assert_eq!(path, "/ice");
    assert_eq!(body["id"], "local-uuid");
    assert_eq!(body["candidate"]["sdpMid"], "0");
    assert_eq!(body["candidate"]["sdpMLineIndex"], 0);
    assert!(body["candidate"].get("usernameFragment").is_none());
}

#[test]
fn test_encode_presence() {
    let (path, body) = encode_signal(&local(), &SignalTarget::Broadcast, &Signal::Join).unwrap();
    assert_eq!(path, "/connect");
    assert_eq!(body, serde_json::json!({"clientId": "local-uuid"}));

    let (path, body) = encode_signal(&local(), &SignalTarget::Broadcast, &Signal::Leave).unwrap();
    assert_eq!(path, "/disconnect");
    assert_eq!(body, serde_json::json!({"clientId": "local-uuid"}));
}

#[test]
fn test_invalid_targets() {
    let peer = SignalTarget::Peer(PeerId::from("remote-uuid"));
    assert!(matches!(
        encode_signal(&local(), &peer, &Signal::Join),
        Err(MeshError::InvalidTarget { signal: "connect", .. })
    ));
    assert!(matches!(
        encode_signal(&local(), &SignalTarget::Broadcast, &Signal::Offer(SessionDescription::offer("v=0"))),
        Err(MeshError::InvalidTarget { signal: "offer", .. })
    ));
}

#[test]
fn test_peer_id_format() {
    let peer_id = PeerId::from("0123456789abcdef");
    assert_eq!(peer_id.short(), "01234567");
    assert_eq!(peer_id.channel(), "peer.0123456789abcdef");
    assert_eq!(PeerId::from("abc").short(), "abc");
}

#[test]
fn test_uuid_generation() {
    let a = PeerId::generate();
    let b = PeerId::generate();
    assert_ne!(a, b);
    assert_eq!(a.as_str().len(), 36);
}

#[test]
fn test_tie_breaking_consistency() {
    let low = PeerId::from("aaaaaa");
    let high = PeerId::from("zzzzzz");

    // Exactly one side of a pair initiates
    assert!(should_initiate(&low, &high));
    assert!(!should_initiate(&high, &low));
    assert!(!should_initiate(&low, &low));
}
