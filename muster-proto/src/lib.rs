//! Shared wire protocol definitions for the Muster signaling relay.

pub mod peer;
pub mod room;
pub mod signal;
