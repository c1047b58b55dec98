//! Peer identity for the signaling protocol.

use serde::{Deserialize, Serialize};

/// Length of a generated peer id in characters.
pub const PEER_ID_LENGTH: usize = 12;

/// Alphabet sampled for peer id generation (lowercase alphanumerics).
const PEER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Server-assigned identity of a connected peer.
///
/// Ids are opaque 12-character lowercase alphanumeric tokens, generated by
/// the relay on admission and never supplied by the client. On the wire a
/// `PeerId` is a bare JSON string, so client-supplied id fields (the
/// `senderPeerId` a signal claims, the `receiverPeerId` it targets)
/// deserialize into this type too and are checked against registered ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generates a fresh random peer id.
    ///
    /// Uniqueness is not guaranteed here; the registry retries generation
    /// on the (negligible) chance of a collision.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let token = (0..PEER_ID_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..PEER_ID_ALPHABET.len());
                char::from(PEER_ID_ALPHABET[idx])
            })
            .collect();
        Self(token)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PeerId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for PeerId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
