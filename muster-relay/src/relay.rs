//! Relay server core: shared state, WebSocket handler, and signaling
//! message routing.
//!
//! The relay admits WebSocket connections, assigns each peer a fresh id,
//! and brokers the WebRTC handshake: `join` groups peers into rooms and
//! announces the membership to everyone in them, `signal` forwards an
//! opaque SDP/ICE payload to one other peer. The relay never looks inside
//! a signal payload; once peers hold a direct data channel they stop
//! needing it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use muster_proto::peer::PeerId;
use muster_proto::room::{RoomId, RoomIdError};
use muster_proto::signal::{self, ClientMessage, DecodeError, ServerMessage};
use tokio::sync::{Mutex, mpsc};

use crate::directory::{Directory, JoinSnapshot};
use crate::liveness;

/// A client behavior that forces disconnection.
///
/// The `Display` text doubles as the close reason delivered to the peer,
/// which is the only client-visible error channel the protocol has.
#[derive(Debug, thiserror::Error)]
pub enum Violation {
    /// The frame failed decoding or carried an unknown type.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// A join named a room outside the accepted id length bounds.
    #[error("invalid room id: {0}")]
    InvalidRoom(#[from] RoomIdError),
    /// A signal claimed a sender id other than the connection's own.
    #[error("spoofed sender")]
    SpoofedSender,
}

/// Shared relay state: the peer/room directory behind a single lock,
/// plus the liveness timing the sweeper applies.
pub struct RelayState {
    /// Single synchronization boundary for every registry and room
    /// mutation.
    directory: Mutex<Directory>,
    /// Silence threshold after which a peer is evicted.
    liveness_window: Duration,
    /// Interval between liveness sweeps.
    sweep_period: Duration,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with the standard liveness timing
    /// ([`liveness::LIVENESS_WINDOW`], [`liveness::SWEEP_PERIOD`]).
    #[must_use]
    pub fn new() -> Self {
        Self::with_liveness(liveness::LIVENESS_WINDOW, liveness::SWEEP_PERIOD)
    }

    /// Creates relay state with custom liveness timing. The binary
    /// wires configured values through here; tests shorten the window
    /// to observe eviction quickly.
    #[must_use]
    pub fn with_liveness(liveness_window: Duration, sweep_period: Duration) -> Self {
        Self {
            directory: Mutex::new(Directory::new()),
            liveness_window,
            sweep_period,
        }
    }

    /// Interval between liveness sweeps.
    #[must_use]
    pub const fn sweep_period(&self) -> Duration {
        self.sweep_period
    }

    /// Admits a new connection: allocates a fresh peer id and stores the
    /// outbound channel under it.
    pub async fn register(&self, channel: mpsc::UnboundedSender<Message>) -> PeerId {
        self.directory.lock().await.register(channel)
    }

    /// Refreshes a peer's liveness timestamp.
    pub async fn touch(&self, peer_id: &PeerId) {
        self.directory.lock().await.touch(peer_id);
    }

    /// Returns a clone of a peer's outbound channel, if registered.
    pub async fn channel_of(&self, peer_id: &PeerId) -> Option<mpsc::UnboundedSender<Message>> {
        self.directory.lock().await.channel_of(peer_id)
    }

    /// Adds a peer to a room and returns the broadcast snapshot, or
    /// `None` when the peer has already been torn down.
    pub async fn join(&self, peer_id: &PeerId, room_id: RoomId) -> Option<JoinSnapshot> {
        self.directory.lock().await.join(peer_id, room_id)
    }

    /// Member ids of a room in join order.
    pub async fn members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.directory.lock().await.members(room_id)
    }

    /// Ids of peers silent for longer than the liveness window.
    pub async fn idle_peers(&self) -> Vec<PeerId> {
        self.directory.lock().await.idle_peers(self.liveness_window)
    }

    /// Number of registered peers.
    pub async fn peer_count(&self) -> usize {
        self.directory.lock().await.peer_count()
    }

    /// Tears down a peer: queues a close frame on its channel, removes
    /// it from every room, and drops its registry entry, all inside one
    /// lock region so no partial state is ever observable. Idempotent;
    /// returns whether the peer was still registered.
    ///
    /// Every disconnect path funnels through here: protocol violations,
    /// transport closure, and liveness eviction.
    pub async fn disconnect(&self, peer_id: &PeerId, reason: &str) -> bool {
        let mut directory = self.directory.lock().await;
        let Some(channel) = directory.channel_of(peer_id) else {
            return false;
        };
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        };
        // Best effort; the writer task may already be gone.
        let _ = channel.send(Message::Close(Some(frame)));
        directory.leave_all(peer_id);
        directory.unregister(peer_id);
        drop(directory);
        tracing::info!(peer_id = %peer_id, reason, "peer disconnected");
        true
    }
}

/// Drives one WebSocket connection from admission to teardown.
///
/// Admission registers the peer and sends `init` with its assigned id
/// before any client frame is processed. A writer task forwards frames
/// queued on the peer's channel to the socket; the reader loop feeds
/// each inbound frame through [`route_message`] in arrival order.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let peer_id = state.register(tx).await;
    tracing::info!(peer_id = %peer_id, "peer connected");

    // Announce the assigned id before the writer task takes the sink.
    let init = ServerMessage::Init {
        your_peer_id: peer_id.clone(),
    };
    if let Err(e) = send_server_msg(&mut ws_sender, &init).await {
        tracing::warn!(peer_id = %peer_id, error = %e, "failed to send init");
        state.disconnect(&peer_id, "socket errored").await;
        return;
    }

    // Writer: forward queued frames to the socket. Exits after flushing
    // a close frame or when the channel closes (teardown dropped the
    // sender), so a queued close reason still reaches the client.
    let writer_peer_id = peer_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::debug!(peer_id = %writer_peer_id, "websocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader: process inbound frames sequentially, in arrival order.
    let reader_peer_id = peer_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            let text: Utf8Bytes = match msg {
                Message::Text(text) => text,
                // Some client stacks deliver JSON in binary frames;
                // valid UTF-8 is handled like text, anything else fails
                // decoding.
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text.into(),
                    Err(_) => {
                        reader_state
                            .disconnect(&reader_peer_id, "malformed message: frame is not UTF-8")
                            .await;
                        break;
                    }
                },
                Message::Close(_) => {
                    tracing::debug!(peer_id = %reader_peer_id, "received close frame");
                    break;
                }
                // Transport-level ping/pong is not part of the protocol
                // and does not count as liveness.
                _ => continue,
            };
            if let Err(violation) = route_message(&reader_state, &reader_peer_id, &text).await {
                tracing::warn!(
                    peer_id = %reader_peer_id,
                    reason = %violation,
                    "protocol violation"
                );
                reader_state
                    .disconnect(&reader_peer_id, &violation.to_string())
                    .await;
                break;
            }
        }
    });

    // Whichever side finishes first, run the (idempotent) teardown, and
    // make sure the writer drains any queued close frame.
    tokio::select! {
        _ = &mut read_task => {
            state.disconnect(&peer_id, "socket closed").await;
            let _ = write_task.await;
        }
        _ = &mut write_task => {
            state.disconnect(&peer_id, "socket closed").await;
            read_task.abort();
        }
    }
    tracing::debug!(peer_id = %peer_id, "connection handler finished");
}

/// Decodes and dispatches one inbound frame.
///
/// Liveness policy: any frame that parses as JSON refreshes the peer's
/// `last_seen` exactly once, before validation or dispatch; frames that
/// are not JSON at all do not count as a sign of life.
async fn route_message(
    state: &Arc<RelayState>,
    peer_id: &PeerId,
    raw: &Utf8Bytes,
) -> Result<(), Violation> {
    let decoded = signal::decode(raw.as_str());
    match &decoded {
        Err(e) if e.is_malformed() => {}
        _ => state.touch(peer_id).await,
    }
    match decoded? {
        ClientMessage::Join { room } => handle_join(state, peer_id, &room).await,
        ClientMessage::Signal {
            sender_peer_id,
            receiver_peer_id,
        } => handle_signal(state, peer_id, &sender_peer_id, &receiver_peer_id, raw).await,
        ClientMessage::Ping => Ok(()),
    }
}

/// Joins a room and broadcasts the refreshed member list to every
/// member, including the joining peer.
async fn handle_join(
    state: &Arc<RelayState>,
    peer_id: &PeerId,
    room: &str,
) -> Result<(), Violation> {
    let room_id = RoomId::parse(room)?;
    let Some(snapshot) = state.join(peer_id, room_id.clone()).await else {
        // The peer lost a race with teardown; nothing to announce.
        return Ok(());
    };
    tracing::info!(
        peer_id = %peer_id,
        room_id = %room_id,
        members = snapshot.members.len(),
        "peer joined room"
    );
    let joined = ServerMessage::Joined {
        other_peer_ids: snapshot.members,
    };
    match signal::encode(&joined) {
        Ok(text) => {
            let frame = Utf8Bytes::from(text);
            for channel in &snapshot.channels {
                // Best effort; a closed channel means that member is
                // already being torn down.
                let _ = channel.send(Message::Text(frame.clone()));
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode joined broadcast");
        }
    }
    Ok(())
}

/// Validates a signal's claimed sender and forwards the original frame
/// verbatim to the receiver, when the receiver is registered.
async fn handle_signal(
    state: &Arc<RelayState>,
    peer_id: &PeerId,
    sender_peer_id: &PeerId,
    receiver_peer_id: &PeerId,
    raw: &Utf8Bytes,
) -> Result<(), Violation> {
    if sender_peer_id != peer_id {
        return Err(Violation::SpoofedSender);
    }
    if let Some(channel) = state.channel_of(receiver_peer_id).await {
        tracing::debug!(from = %peer_id, to = %receiver_peer_id, "relaying signal");
        let _ = channel.send(Message::Text(raw.clone()));
    } else {
        // The receiver may have legitimately disconnected moments ago;
        // dropping the message is not an error to the sender.
        tracing::debug!(
            from = %peer_id,
            to = %receiver_peer_id,
            "dropping signal for unknown receiver"
        );
    }
    Ok(())
}

/// Encodes and sends a server message directly on a WebSocket sink.
async fn send_server_msg(
    ws_sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), String> {
    let text = signal::encode(msg).map_err(|e| format!("encode error: {e}"))?;
    ws_sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("websocket send error: {e}"))
}

/// Starts the relay server on the given address and returns the bound
/// address and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given
/// address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-built [`RelayState`] and spawns
/// the liveness sweeper for it.
///
/// Use [`RelayState::with_liveness`] to shorten the eviction timing in
/// tests.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given
/// address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/signaling", axum::routing::get(ws_handler))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    liveness::spawn_sweeper(state);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound
/// address and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

/// axum handler for the signaling endpoint: upgrades WebSocket requests,
/// answers plain HTTP with 501 Not Implemented.
async fn ws_handler(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(rejection) => {
            tracing::debug!(error = %rejection, "non-upgrade request on signaling endpoint");
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}
