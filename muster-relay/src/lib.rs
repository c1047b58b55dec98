//! Muster signaling relay library.
//!
//! Exposes the relay server for tests and embedding. The relay admits
//! WebSocket connections, assigns each peer an id, tracks room
//! membership, and forwards WebRTC handshake payloads between peers.

pub mod config;
pub mod directory;
pub mod liveness;
pub mod relay;
