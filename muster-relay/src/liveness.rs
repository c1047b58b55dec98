//! Background liveness sweeping.
//!
//! Browsers on sleeping phones do not close TCP connections; they just
//! stop talking. Every client frame that parses as JSON counts as a
//! sign of life, and a periodic sweep evicts peers that have been
//! silent for longer than the window, reclaiming their registry entries
//! and room slots.

use std::sync::Arc;
use std::time::Duration;

use crate::relay::RelayState;

/// Interval between sweeps.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(5);

/// Silence threshold after which a peer is considered gone.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(120);

/// Close reason delivered to peers evicted by the sweeper.
pub const STALE_PEER_REASON: &str = "no ping for 2 minutes";

/// Spawns the sweeper task for the given relay state.
///
/// Each tick collects the peers whose `last_seen` is older than the
/// liveness window and disconnects them through the same teardown path
/// as every other disconnect. The task runs for the lifetime of the
/// process.
pub fn spawn_sweeper(state: Arc<RelayState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.sweep_period());
        // The first tick fires immediately and would sweep an empty
        // directory; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let idle = state.idle_peers().await;
            for peer_id in idle {
                tracing::info!(peer_id = %peer_id, "evicting stale peer");
                state.disconnect(&peer_id, STALE_PEER_REASON).await;
            }
        }
    })
}
