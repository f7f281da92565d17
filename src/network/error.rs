//! Network error types

use thiserror::Error;

/// Errors that can occur in signaling, relay and peer-link code
///
/// TLS setup failures surface as `Io` from the acceptor.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Peer channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Direct channel error: {0}")]
    Rtc(#[from] webrtc::Error),

    #[error("Identity does not fit a routed frame: {0}")]
    InvalidIdentity(String),
}
