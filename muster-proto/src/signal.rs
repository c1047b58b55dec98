//! Signaling messages exchanged between browser peers and the relay.
//!
//! The wire format is UTF-8 JSON text, one object per WebSocket frame,
//! tagged by a `type` field. Field names (`yourPeerId`, `otherPeerIds`,
//! `senderPeerId`, `receiverPeerId`) are part of the deployed wire
//! format; deployed browser clients depend on them verbatim.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Tags accepted from clients. Anything else is a protocol violation.
const CLIENT_MESSAGE_TYPES: [&str; 3] = ["join", "signal", "ping"];

/// A message sent by a client to the relay.
///
/// `signal` frames carry arbitrary additional payload fields (SDP offers,
/// ICE candidates); the relay never inspects them, so only the routing
/// fields are modeled here and relaying forwards the original frame
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Request to join a room and receive its member list.
    Join {
        /// Raw room id; validated against the length bounds on dispatch.
        room: String,
    },
    /// A handshake payload addressed to one other peer.
    Signal {
        /// Id the sender claims for itself; must equal the connection's
        /// assigned id.
        #[serde(rename = "senderPeerId")]
        sender_peer_id: PeerId,
        /// Id of the peer the payload is addressed to.
        #[serde(rename = "receiverPeerId")]
        receiver_peer_id: PeerId,
    },
    /// Keepalive; refreshes liveness and nothing else.
    Ping,
}

/// A message sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// First message on every connection: the peer's assigned id.
    Init {
        /// The id the relay bound to this connection.
        #[serde(rename = "yourPeerId")]
        your_peer_id: PeerId,
    },
    /// Sent to every member of a room when its membership grows.
    Joined {
        /// Full member-id list of the room, in join order.
        #[serde(rename = "otherPeerIds")]
        other_peer_ids: Vec<PeerId>,
    },
}

/// Why an inbound frame was rejected.
///
/// The classification matters for liveness bookkeeping: a frame that is
/// not JSON at all ([`DecodeError::Malformed`]) never counts as a sign of
/// life, while a well-formed frame with a bad tag or bad fields does.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The frame has no string `type` field.
    #[error("message missing type tag")]
    MissingType,
    /// The `type` value names no known message kind.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// A known message kind with missing or mistyped fields.
    #[error("invalid {kind} message: {source}")]
    InvalidFields {
        /// The message kind whose schema was violated.
        kind: String,
        /// Underlying deserialization error.
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Whether the raw frame failed to parse as JSON at all.
    #[must_use]
    pub const fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Decodes one inbound frame into a [`ClientMessage`].
///
/// # Errors
///
/// Returns a [`DecodeError`] identifying whether the frame was not JSON,
/// carried a missing or unknown `type`, or failed field validation for a
/// known type.
pub fn decode(text: &str) -> Result<ClientMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;
    let kind = match value.get("type").and_then(serde_json::Value::as_str) {
        Some(kind) => kind.to_owned(),
        None => return Err(DecodeError::MissingType),
    };
    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { kind, source })
}

/// Encodes an outbound message as a JSON string.
///
/// # Errors
///
/// Returns the underlying `serde_json` error if serialization fails.
pub fn encode(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
