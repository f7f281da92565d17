//! Control-plane message vocabulary
//!
//! Every control message is a JSON object with a `type` field. The vocabulary
//! is split by direction so that each receiver decodes into a closed set of
//! variants; anything else lands in an explicit `Unrecognized` variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Display metadata shown to other peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetadata {
    pub display_name: String,
    pub device_name: String,
}

/// Public view of a peer, as broadcast to other room members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: DisplayMetadata,
    pub rtc_supported: bool,
}

/// Payload of the `display-name` message sent to a freshly connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayNameInfo {
    pub display_name: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Peers {
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Relayed connection-setup payload; `sender` is stamped by the relay
    Signal {
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice: Option<Value>,
    },
    Ping,
    DisplayName {
        message: DisplayNameInfo,
    },
    PeerModifyName {
        peer: PeerInfo,
    },
    #[serde(other)]
    Unrecognized,
}

/// Client -> server messages handled by the server itself
///
/// Messages carrying a `to` field never reach this decode step; they are
/// routed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Pong,
    Disconnect,
    Restart,
    PeerModifyName {
        #[serde(rename = "displayName")]
        display_name: String,
    },
    #[serde(other)]
    Unrecognized,
}

/// Outbound connection-setup message, addressed to a remote identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalTag,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalTag {
    Signal,
}

impl SignalEnvelope {
    pub fn sdp(to: &str, sdp: Value) -> Self {
        Self {
            kind: SignalTag::Signal,
            to: to.to_string(),
            sdp: Some(sdp),
            ice: None,
        }
    }

    pub fn ice(to: &str, ice: Value) -> Self {
        Self {
            kind: SignalTag::Signal,
            to: to.to_string(),
            sdp: None,
            ice: Some(ice),
        }
    }
}

/// Peer <-> peer messages, carried by the direct channel or the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    Header {
        name: String,
        #[serde(default)]
        mime: String,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    Partition {
        offset: u64,
    },
    PartitionReceived {
        offset: u64,
    },
    Progress {
        progress: f64,
    },
    TransferComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    CancelSend {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    MClearCancel,
    /// Both fields are byte-safe encoded, see [`super::text`]
    Text {
        text: String,
        sender: String,
    },
    #[serde(other)]
    Unrecognized,
}

impl PeerMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Encode as a JSON text frame addressed to `to`, for relay delivery
    pub fn to_relay_json(&self, to: &str) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert("to".to_string(), Value::String(to.to_string()));
        }
        serde_json::to_string(&value)
    }

    /// Message type tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Header { .. } => "header",
            PeerMessage::Partition { .. } => "partition",
            PeerMessage::PartitionReceived { .. } => "partition-received",
            PeerMessage::Progress { .. } => "progress",
            PeerMessage::TransferComplete { .. } => "transfer-complete",
            PeerMessage::CancelSend { .. } => "cancel-send",
            PeerMessage::MClearCancel => "m-clear-cancel",
            PeerMessage::Text { .. } => "text",
            PeerMessage::Unrecognized => "unrecognized",
        }
    }
}
