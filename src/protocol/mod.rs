//! Wire protocol definitions
//!
//! Defines the JSON control vocabulary, the byte-safe text encoding and the
//! routed chunk framing used by the relay.

mod frame;
mod message;
pub mod text;

pub use frame::{decode_routed_chunk, encode_routed_chunk, MAX_IDENTITY_LEN};
pub use message::{
    ClientMessage, DisplayMetadata, DisplayNameInfo, PeerInfo, PeerMessage, ServerMessage,
    SignalEnvelope, SignalTag,
};
