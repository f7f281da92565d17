//! Routed chunk frames for relay delivery
//!
//! Frame format:
//! - identity length: 2 bytes, big-endian
//! - identity: UTF-8 bytes (recipient when sent, sender when delivered)
//! - chunk: raw file bytes, untouched

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Longest identity that fits the length prefix
pub const MAX_IDENTITY_LEN: usize = u16::MAX as usize;

/// Wrap a chunk with the identity it is routed to (or from)
///
/// Returns `None` when the identity does not fit the length prefix.
pub fn encode_routed_chunk(identity: &str, chunk: &[u8]) -> Option<Bytes> {
    let id = identity.as_bytes();
    if id.is_empty() || id.len() > MAX_IDENTITY_LEN {
        return None;
    }
    let mut buf = BytesMut::with_capacity(2 + id.len() + chunk.len());
    buf.put_u16(id.len() as u16);
    buf.put_slice(id);
    buf.put_slice(chunk);
    Some(buf.freeze())
}

/// Split a routed frame into identity and chunk bytes
pub fn decode_routed_chunk(frame: &[u8]) -> Option<(&str, &[u8])> {
    if frame.len() < 2 {
        return None;
    }
    let mut rest = frame;
    let len = rest.get_u16() as usize;
    if len == 0 || rest.len() < len {
        return None;
    }
    let identity = std::str::from_utf8(&rest[..len]).ok()?;
    Some((identity, &rest[len..]))
}
