//! Integration tests for the WebRTC signaling flow.
//!
//! Exercises the relay over real WebSocket connections: peer admission,
//! room membership announcements, verbatim signal forwarding, violation
//! teardown, and liveness eviction.
//!
//! Verification command: `cargo test --test signaling_flow`

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

use muster_proto::peer::PEER_ID_LENGTH;
use muster_proto::room::RoomId;
use muster_relay::liveness::STALE_PEER_REASON;
use muster_relay::relay::{RelayState, start_server, start_server_with_state};

// =============================================================================
// Type aliases and helpers
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts a relay server on a random port for testing.
async fn start_relay() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test relay")
}

/// Connects a WebSocket client, consumes the `init` frame, and returns
/// the stream together with the relay-assigned peer id.
async fn connect(addr: std::net::SocketAddr) -> (WsStream, String) {
    let url = format!("ws://{addr}/signaling");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let init = recv_json(&mut ws).await;
    assert_eq!(init["type"], "init", "expected init, got {init}");
    let peer_id = init["yourPeerId"].as_str().unwrap().to_string();
    (ws, peer_id)
}

/// Sends a JSON value as a text frame.
async fn send_json(ws: &mut WsStream, value: &serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

/// Receives the next text frame and parses it as JSON.
async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("recv timed out")
        .unwrap()
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

/// Waits for a server-initiated close frame and returns its reason.
async fn recv_close_reason(ws: &mut WsStream) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let next = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("close timed out");
        match next {
            Some(Ok(tungstenite::Message::Close(close))) => {
                return close.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
            }
            Some(Ok(_)) => {}
            Some(Err(_)) | None => panic!("connection ended without a close frame"),
        }
    }
}

/// Shorthand for the join message.
fn join_msg(room: &str) -> serde_json::Value {
    json!({"type": "join", "room": room})
}

/// Shorthand for the expected membership broadcast.
fn joined_msg(members: &[&str]) -> serde_json::Value {
    json!({"type": "joined", "otherPeerIds": members})
}

// =============================================================================
// Admission
// =============================================================================

/// Every connection is greeted with `init` carrying a fresh peer id in
/// the relay's id alphabet.
#[tokio::test]
async fn init_assigns_a_fresh_peer_id() {
    let (addr, _handle) = start_relay().await;

    let (_ws_a, a) = connect(addr).await;
    let (_ws_b, b) = connect(addr).await;

    for id in [&a, &b] {
        assert_eq!(id.len(), PEER_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
    assert_ne!(a, b);
}

// =============================================================================
// Room membership
// =============================================================================

/// Each join re-announces the full member list, in join order, to every
/// member of the room including the one that just joined.
#[tokio::test]
async fn joins_announce_membership_in_join_order() {
    let (addr, _handle) = start_relay().await;
    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;
    let (mut ws_c, c) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));

    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));

    send_json(&mut ws_c, &join_msg("troop42room")).await;
    let expected = joined_msg(&[&a, &b, &c]);
    assert_eq!(recv_json(&mut ws_a).await, expected);
    assert_eq!(recv_json(&mut ws_b).await, expected);
    assert_eq!(recv_json(&mut ws_c).await, expected);
}

/// Joining a room the peer is already in changes nothing but still
/// re-broadcasts the membership, so a client that missed the first
/// announcement can recover.
#[tokio::test]
async fn rejoin_reannounces_without_duplicating_the_member() {
    let (addr, _handle) = start_relay().await;
    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));
    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));
}

/// A peer can sit in several rooms at once; each room announces only
/// its own membership.
#[tokio::test]
async fn peer_can_join_multiple_rooms() {
    let (addr, _handle) = start_relay().await;
    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;
    let (mut ws_c, c) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));
    send_json(&mut ws_a, &join_msg("troop43room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));

    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));

    send_json(&mut ws_c, &join_msg("troop43room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &c]));
}

/// Once a peer disconnects, later joins to its room no longer list it,
/// and the remaining members never receive a departure frame.
#[tokio::test]
async fn departed_peer_vanishes_from_later_announcements() {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test relay");
    let room = RoomId::parse("troop42room").unwrap();

    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));
    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));

    ws_b.close(None).await.unwrap();
    let mut members = state.members(&room).await;
    for _ in 0..100 {
        if members.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        members = state.members(&room).await;
    }
    assert_eq!(members.len(), 1, "departed peer still listed: {members:?}");

    let (mut ws_c, c) = connect(addr).await;
    send_json(&mut ws_c, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_c).await, joined_msg(&[&a, &c]));
    // The only frame A sees after B's departure is C's join broadcast.
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &c]));
}

// =============================================================================
// Signal forwarding
// =============================================================================

/// Offer and answer travel between peers byte-identical, extra fields
/// and formatting quirks included.
#[tokio::test]
async fn signals_are_forwarded_verbatim_both_ways() {
    let (addr, _handle) = start_relay().await;
    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));
    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));

    let offer = format!(
        "{{\"type\":\"signal\", \"senderPeerId\":\"{a}\",\"receiverPeerId\":\"{b}\",\"sdp\":\"v=0 offer\",\"candidates\":[]}}"
    );
    ws_a.send(tungstenite::Message::Text(offer.clone().into()))
        .await
        .unwrap();
    let got = ws_b.next().await.unwrap().unwrap();
    assert_eq!(got.to_text().unwrap(), offer);

    let answer = format!(
        "{{\"type\":\"signal\",\"senderPeerId\":\"{b}\",\"receiverPeerId\":\"{a}\",\"sdp\":\"v=0 answer\"}}"
    );
    ws_b.send(tungstenite::Message::Text(answer.clone().into()))
        .await
        .unwrap();
    let got = ws_a.next().await.unwrap().unwrap();
    assert_eq!(got.to_text().unwrap(), answer);
}

/// JSON arriving in a binary frame is handled the same as text.
#[tokio::test]
async fn binary_frames_carrying_json_are_accepted() {
    let (addr, _handle) = start_relay().await;
    let (mut ws, peer_id) = connect(addr).await;

    let payload = join_msg("troop42room").to_string().into_bytes();
    ws.send(tungstenite::Message::Binary(payload.into()))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut ws).await, joined_msg(&[&peer_id]));
}

// =============================================================================
// Violations
// =============================================================================

/// A spoofed sender id tears the offender down with a close reason, and
/// the teardown scrubs it from its rooms.
#[tokio::test]
async fn spoofed_signal_disconnects_and_scrubs_the_offender() {
    let (addr, _handle) = start_relay().await;
    let (mut ws_a, a) = connect(addr).await;
    let (mut ws_b, b) = connect(addr).await;

    send_json(&mut ws_a, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a]));
    send_json(&mut ws_b, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_a).await, joined_msg(&[&a, &b]));
    assert_eq!(recv_json(&mut ws_b).await, joined_msg(&[&a, &b]));

    send_json(
        &mut ws_a,
        &json!({
            "type": "signal",
            "senderPeerId": "impersonator",
            "receiverPeerId": b,
            "sdp": "offer",
        }),
    )
    .await;
    assert_eq!(recv_close_reason(&mut ws_a).await, "spoofed sender");

    // A is gone from the room: C's join announces only B and C.
    let (mut ws_c, c) = connect(addr).await;
    send_json(&mut ws_c, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_c).await, joined_msg(&[&b, &c]));
}

/// Room ids outside the length bounds are violations with a close
/// reason naming the problem.
#[tokio::test]
async fn out_of_bounds_room_ids_are_rejected() {
    let (addr, _handle) = start_relay().await;

    let (mut ws, _) = connect(addr).await;
    send_json(&mut ws, &join_msg("short")).await;
    assert!(recv_close_reason(&mut ws).await.contains("room id"));

    let (mut ws, _) = connect(addr).await;
    send_json(&mut ws, &join_msg(&"r".repeat(100))).await;
    assert!(recv_close_reason(&mut ws).await.contains("room id"));
}

/// Unknown message types and non-JSON frames both end the connection.
#[tokio::test]
async fn garbage_frames_end_the_connection() {
    let (addr, _handle) = start_relay().await;

    let (mut ws, _) = connect(addr).await;
    send_json(&mut ws, &json!({"type": "teleport"})).await;
    assert!(
        recv_close_reason(&mut ws)
            .await
            .contains("unknown message type")
    );

    let (mut ws, _) = connect(addr).await;
    ws.send(tungstenite::Message::Text("{not json".into()))
        .await
        .unwrap();
    assert!(recv_close_reason(&mut ws).await.contains("malformed"));
}

/// A signal addressed to an unregistered peer is dropped without
/// punishing the sender.
#[tokio::test]
async fn signal_to_unknown_receiver_is_dropped_silently() {
    let (addr, _handle) = start_relay().await;
    let (mut ws, peer_id) = connect(addr).await;

    send_json(
        &mut ws,
        &json!({
            "type": "signal",
            "senderPeerId": peer_id,
            "receiverPeerId": "zzzzzzzzzzzz",
            "sdp": "offer",
        }),
    )
    .await;

    // The connection is still healthy afterwards.
    send_json(&mut ws, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws).await, joined_msg(&[&peer_id]));
}

// =============================================================================
// Liveness
// =============================================================================

/// Under a shortened liveness window, a silent peer is evicted with the
/// stale-peer close reason while a pinging peer stays connected.
#[tokio::test]
async fn silent_peers_are_evicted_while_pinging_peers_survive() {
    let state = Arc::new(RelayState::with_liveness(
        Duration::from_millis(300),
        Duration::from_millis(50),
    ));
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", state)
        .await
        .expect("failed to start test relay");

    let (mut ws_active, active_id) = connect(addr).await;
    let (mut ws_silent, _) = connect(addr).await;

    // Ping through two full windows while the other peer stays mute.
    for _ in 0..8 {
        send_json(&mut ws_active, &json!({"type": "ping"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(recv_close_reason(&mut ws_silent).await, STALE_PEER_REASON);

    // The pinging peer is still registered and fully functional.
    send_json(&mut ws_active, &join_msg("troop42room")).await;
    assert_eq!(recv_json(&mut ws_active).await, joined_msg(&[&active_id]));
}
