//! roomdrop - Local-network peer discovery and direct file/text transfer
//!
//! A signaling server groups peers into rooms and relays negotiation
//! messages between them. Clients open direct data channels to each other
//! and stream files in partitioned chunks, falling back to the server relay
//! when a direct channel is not possible.

pub mod network;
pub mod peer;
pub mod protocol;
pub mod transfer;

pub use network::{SignalingClient, SignalingServer};
pub use peer::{PeersManager, SessionConfig, SessionEvent, SessionHandle};
pub use protocol::PeerMessage;
pub use transfer::{OutgoingFile, TransferConfig, TransferEvent};
