//! Per-peer heartbeat and eviction

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::protocol::ServerMessage;

use super::registry::{PeerHandle, RoomRegistry};

/// Default interval between pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Identifies the peer a monitor watches
#[derive(Debug, Clone)]
pub struct LivenessTarget {
    pub room_key: String,
    pub identity: String,
    pub handle: PeerHandle,
}

/// Start the heartbeat for a peer and register its timer with the registry
///
/// The peer is pinged every `interval` and evicted once no `pong` has been
/// seen for twice that long. The returned task is also cancelled by the
/// registry when the peer leaves.
pub fn spawn_liveness(
    registry: Arc<RoomRegistry>,
    target: LivenessTarget,
    interval: Duration,
) -> JoinHandle<()> {
    let room_key = target.room_key.clone();
    let identity = target.identity.clone();
    let session = target.handle.session();

    let task = tokio::spawn(run_heartbeat(registry.clone(), target, interval));
    registry.attach_liveness(&room_key, &identity, session, task.abort_handle());
    task
}

async fn run_heartbeat(registry: Arc<RoomRegistry>, target: LivenessTarget, interval: Duration) {
    let session = target.handle.session();
    let mut next_ping = Instant::now();

    loop {
        let Some(last_beat) = registry.last_heartbeat(&target.room_key, &target.identity, session)
        else {
            debug!("Heartbeat for {} stopped, peer gone", target.identity);
            return;
        };

        let deadline = last_beat + interval * 2;
        let now = Instant::now();
        if now >= deadline {
            info!(
                "Peer {} missed heartbeats for {:?}, evicting",
                target.identity,
                now - last_beat
            );
            registry.leave(&target.room_key, &target.identity, session);
            return;
        }

        if now >= next_ping {
            target.handle.send(&ServerMessage::Ping);
            next_ping = now + interval;
        }

        sleep_until(next_ping.min(deadline)).await;
    }
}
