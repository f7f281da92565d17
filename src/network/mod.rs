//! Network module for peer discovery and signaling
//!
//! Server side: room registry, liveness, relay dispatch and the WebSocket
//! accept loop. Client side: the signaling connection.

mod error;
mod grouping;
mod handshake;
mod liveness;
mod registry;
mod relay;
mod server;
mod signaling;

pub use error::NetworkError;
pub use grouping::{client_addr, normalize_addr, resolve_room_key, GroupingMode, SHARED_ROOM_KEY};
pub use handshake::{display_name_for, peer_id_from_cookie, UpgradeRequest, PEER_ID_COOKIE};
pub use liveness::{spawn_liveness, LivenessTarget, DEFAULT_HEARTBEAT_INTERVAL};
pub use registry::{PeerHandle, PeerRecord, RoomRegistry};
pub use relay::{dispatch_binary, dispatch_text, PeerContext, RelayOutcome, MAX_DISPLAY_NAME_CHARS};
pub use server::{ServerConfig, ServerExit, SignalingServer};
pub use signaling::{
    Capability, ConnectOptions, Incoming, SignalingClient, SignalingConnection, SignalingReceiver,
    SignalingSender,
};
