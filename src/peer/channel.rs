//! Delivery path abstraction
//!
//! The transfer engine writes frames to a [`PeerChannel`] without knowing
//! whether they travel over a direct channel or through the relay.

use async_trait::async_trait;
use bytes::Bytes;

use crate::network::NetworkError;

/// One frame exchanged between two peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    /// JSON control message
    Control(String),
    /// Raw chunk body
    Chunk(Bytes),
}

/// Outgoing half of a peer-to-peer delivery path
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send one frame; ordering between calls is preserved
    async fn send(&self, frame: ChannelFrame) -> Result<(), NetworkError>;

    /// Short label for logs
    fn kind(&self) -> &'static str;
}
