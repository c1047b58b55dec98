//! Room identity and validation.

/// Exclusive lower bound on room id length, in characters.
pub const ROOM_ID_MIN_LENGTH: usize = 5;

/// Exclusive upper bound on room id length, in characters.
pub const ROOM_ID_MAX_LENGTH: usize = 100;

/// Error returned when a room id fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomIdError {
    /// The id's character count falls outside the accepted open interval.
    #[error("room id must be 6 to 99 characters, got {length}")]
    Length {
        /// Character count of the rejected id.
        length: usize,
    },
}

/// Validated room identifier.
///
/// Room ids are opaque client-supplied strings, accepted only when their
/// character count is strictly between [`ROOM_ID_MIN_LENGTH`] and
/// [`ROOM_ID_MAX_LENGTH`]. The bounds keep trivially guessable or
/// oversized keys out of the directory. There is deliberately no serde on
/// this type: ids enter the system as raw strings and pass through
/// [`RoomId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Validates and wraps a raw room id.
    ///
    /// # Errors
    ///
    /// Returns [`RoomIdError::Length`] when the character count is not
    /// strictly between the bounds.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        let length = raw.chars().count();
        if length > ROOM_ID_MIN_LENGTH && length < ROOM_ID_MAX_LENGTH {
            Ok(Self(raw.to_string()))
        } else {
            Err(RoomIdError::Length { length })
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
