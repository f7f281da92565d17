//! Inbound frame dispatch for the signaling server

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::ClientMessage;

use super::registry::RoomRegistry;

/// Longest display name accepted from a rename request
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

/// Where a connected peer sits in the registry
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub room_key: String,
    pub identity: String,
    pub session: u64,
}

/// What the connection task should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Continue,
    /// The peer asked to leave; its record is already gone
    Disconnect,
    /// The peer asked the host process to restart
    Restart,
}

/// Handle a text frame from a peer
pub fn dispatch_text(registry: &RoomRegistry, ctx: &PeerContext, text: &str) -> RelayOutcome {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            debug!("Dropping malformed frame from {}", ctx.identity);
            return RelayOutcome::Continue;
        }
    };

    if value.get("to").is_some_and(Value::is_string) {
        registry.route(&ctx.room_key, &ctx.identity, value);
        return RelayOutcome::Continue;
    }

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(ClientMessage::Pong) => {
            registry.touch(&ctx.room_key, &ctx.identity, ctx.session);
        }
        Ok(ClientMessage::Disconnect) => {
            registry.leave(&ctx.room_key, &ctx.identity, ctx.session);
            return RelayOutcome::Disconnect;
        }
        Ok(ClientMessage::Restart) => {
            info!("Peer {} asked the server to restart", ctx.identity);
            return RelayOutcome::Restart;
        }
        Ok(ClientMessage::PeerModifyName { display_name }) => {
            let name: String = display_name.trim().chars().take(MAX_DISPLAY_NAME_CHARS).collect();
            if !name.is_empty() {
                registry.rename(&ctx.room_key, &ctx.identity, ctx.session, &name);
            }
        }
        Ok(ClientMessage::Unrecognized) => {
            warn!("Unknown message type from {}, dropped", ctx.identity);
        }
        Err(e) => {
            debug!("Dropping invalid message from {}: {}", ctx.identity, e);
        }
    }
    RelayOutcome::Continue
}

/// Handle a binary frame from a peer (a routed chunk in fallback mode)
pub fn dispatch_binary(registry: &RoomRegistry, ctx: &PeerContext, frame: &[u8]) -> RelayOutcome {
    registry.route_chunk(&ctx.room_key, &ctx.identity, frame);
    RelayOutcome::Continue
}
