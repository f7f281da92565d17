//! Delivery through the signaling relay
//!
//! Used when either side cannot open a direct channel. Control frames are
//! addressed with `to`; chunk frames are prefixed with the recipient identity.

use async_trait::async_trait;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::network::{NetworkError, SignalingSender};
use crate::protocol::encode_routed_chunk;

use super::channel::{ChannelFrame, PeerChannel};

/// [`PeerChannel`] over the signaling socket
pub struct RelayChannel {
    peer: String,
    signaling: SignalingSender,
}

impl RelayChannel {
    pub fn new(peer: impl Into<String>, signaling: SignalingSender) -> Self {
        Self {
            peer: peer.into(),
            signaling,
        }
    }
}

/// Add the routing field to a JSON control frame
fn address(json: &str, to: &str) -> Result<String, NetworkError> {
    let mut value: Value = serde_json::from_str(json)?;
    match &mut value {
        Value::Object(map) => {
            map.insert("to".to_string(), Value::String(to.to_string()));
        }
        _ => {
            return Err(NetworkError::SignalingError(
                "Control frame is not an object".to_string(),
            ))
        }
    }
    Ok(serde_json::to_string(&value)?)
}

#[async_trait]
impl PeerChannel for RelayChannel {
    async fn send(&self, frame: ChannelFrame) -> Result<(), NetworkError> {
        match frame {
            ChannelFrame::Control(json) => {
                let addressed = address(&json, &self.peer)?;
                self.signaling.send_frame(Message::Text(addressed))
            }
            ChannelFrame::Chunk(chunk) => {
                let routed = encode_routed_chunk(&self.peer, &chunk)
                    .ok_or_else(|| NetworkError::InvalidIdentity(self.peer.clone()))?;
                self.signaling.send_frame(Message::Binary(routed.to_vec()))
            }
        }
    }

    fn kind(&self) -> &'static str {
        "relay"
    }
}
