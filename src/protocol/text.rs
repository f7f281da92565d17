//! Byte-safe text encoding for `text` messages
//!
//! Text is carried as standard base64 of its UTF-8 bytes, which is what a
//! browser produces with `btoa(unescape(encodeURIComponent(s)))`.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::message::PeerMessage;

/// Encode arbitrary text into its byte-safe representation
pub fn encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Decode a byte-safe representation back into text
///
/// Returns `None` when the input is not base64 or not UTF-8.
pub fn decode(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

/// Build a `text` message from plain text and the sender's display name
pub fn text_message(text: &str, sender_name: &str) -> PeerMessage {
    PeerMessage::Text {
        text: encode(text),
        sender: encode(sender_name),
    }
}
