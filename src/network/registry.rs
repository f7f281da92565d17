//! Room registry
//!
//! Maps a room key to the peers currently in that room. Rooms are created on
//! the first join and removed as soon as their last peer leaves, so a key is
//! present if and only if its room is non-empty.
//!
//! All operations run under one lock and never await while holding it: sends
//! go into per-peer unbounded queues drained by each peer's writer task.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::protocol::{decode_routed_chunk, encode_routed_chunk, PeerInfo, ServerMessage};

/// Write side of a connected peer's socket
#[derive(Debug, Clone)]
pub struct PeerHandle {
    session: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl PeerHandle {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { session, tx }
    }

    /// Socket session this handle writes to
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Best-effort send of a server message
    pub fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_frame(Message::Text(json)),
            Err(e) => warn!("Failed to encode message for session {}: {}", self.session, e),
        }
    }

    /// Best-effort send of a raw frame
    pub fn send_frame(&self, frame: Message) {
        if self.tx.send(frame).is_err() {
            debug!("Session {} writer gone, frame dropped", self.session);
        }
    }

    /// Ask the writer to close the socket
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

/// Server-side state for one connected peer
#[derive(Debug)]
pub struct PeerRecord {
    pub info: PeerInfo,
    pub addr: IpAddr,
    handle: PeerHandle,
    last_heartbeat: Instant,
    liveness: Option<AbortHandle>,
}

impl PeerRecord {
    pub fn new(info: PeerInfo, addr: IpAddr, handle: PeerHandle) -> Self {
        Self {
            info,
            addr,
            handle,
            last_heartbeat: Instant::now(),
            liveness: None,
        }
    }

    fn cancel_liveness(&mut self) {
        if let Some(timer) = self.liveness.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    peers: HashMap<String, PeerRecord>,
}

impl Room {
    fn broadcast_except(&self, identity: &str, msg: &ServerMessage) {
        for (id, peer) in &self.peers {
            if id != identity {
                peer.handle.send(msg);
            }
        }
    }
}

/// Registry of rooms keyed by grouping key
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    next_session: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a session number for a new socket
    pub fn next_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add a peer to its room and return the other members
    ///
    /// Existing members are told about the newcomer before the returned list
    /// is taken. A stale record for the same identity (a reconnected
    /// signaling socket) is dropped first without a `peer-left`.
    pub fn join(&self, room_key: &str, record: PeerRecord) -> Vec<PeerInfo> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_key.to_string()).or_insert_with(|| {
            info!("Room {} created", room_key);
            Room::default()
        });

        let identity = record.info.id.clone();
        if let Some(mut stale) = room.peers.remove(&identity) {
            info!(
                "Peer {} reconnected, replacing session {}",
                identity,
                stale.handle.session()
            );
            stale.cancel_liveness();
            stale.handle.close();
        }

        room.broadcast_except(
            &identity,
            &ServerMessage::PeerJoined {
                peer: record.info.clone(),
            },
        );
        let existing: Vec<PeerInfo> = room.peers.values().map(|p| p.info.clone()).collect();

        info!(
            "Peer {} ({}) joined room {}",
            identity, record.info.name.display_name, room_key
        );
        room.peers.insert(identity, record);
        existing
    }

    /// Remove a peer from its room
    ///
    /// No-op (returns false) if the peer is absent or the record belongs to a
    /// newer socket session.
    pub fn leave(&self, room_key: &str, identity: &str, session: u64) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get_mut(room_key) else {
            return false;
        };

        let owned = room
            .peers
            .get(identity)
            .is_some_and(|p| p.handle.session() == session);
        if !owned {
            return false;
        }

        if let Some(mut record) = room.peers.remove(identity) {
            record.cancel_liveness();
            record.handle.close();
        }
        info!("Peer {} left room {}", identity, room_key);

        if room.peers.is_empty() {
            rooms.remove(room_key);
            info!("Room {} removed (empty)", room_key);
        } else {
            room.broadcast_except(
                identity,
                &ServerMessage::PeerLeft {
                    peer_id: identity.to_string(),
                },
            );
        }
        true
    }

    /// Forward a JSON envelope to the peer named by its `to` field
    ///
    /// The `to` field is removed and `sender` is stamped with the sending
    /// identity. Unknown recipients are dropped silently.
    pub fn route(&self, room_key: &str, from: &str, mut envelope: Value) -> bool {
        let Value::Object(map) = &mut envelope else {
            return false;
        };
        let Some(Value::String(to)) = map.remove("to") else {
            return false;
        };
        map.insert("sender".to_string(), Value::String(from.to_string()));

        let json = match serde_json::to_string(&envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode routed envelope: {}", e);
                return false;
            }
        };

        let rooms = self.rooms.lock();
        match rooms.get(room_key).and_then(|room| room.peers.get(&to)) {
            Some(recipient) => {
                debug!("Routing envelope {} -> {}", from, to);
                recipient.handle.send_frame(Message::Text(json));
                true
            }
            None => {
                debug!("Dropping envelope from {} to unknown peer {}", from, to);
                false
            }
        }
    }

    /// Forward a routed binary chunk frame, swapping recipient for sender
    pub fn route_chunk(&self, room_key: &str, from: &str, frame: &[u8]) -> bool {
        let Some((to, chunk)) = decode_routed_chunk(frame) else {
            debug!("Dropping malformed chunk frame from {}", from);
            return false;
        };
        let Some(forwarded) = encode_routed_chunk(from, chunk) else {
            return false;
        };

        let rooms = self.rooms.lock();
        match rooms.get(room_key).and_then(|room| room.peers.get(to)) {
            Some(recipient) => {
                recipient.handle.send_frame(Message::Binary(forwarded.to_vec()));
                true
            }
            None => {
                debug!("Dropping chunk frame from {} to unknown peer {}", from, to);
                false
            }
        }
    }

    /// Record a heartbeat answer
    pub fn touch(&self, room_key: &str, identity: &str, session: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(record) = Self::record_mut(&mut rooms, room_key, identity, session) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// Last heartbeat of a peer, or `None` once it has left
    pub fn last_heartbeat(&self, room_key: &str, identity: &str, session: u64) -> Option<Instant> {
        let mut rooms = self.rooms.lock();
        Self::record_mut(&mut rooms, room_key, identity, session).map(|r| r.last_heartbeat)
    }

    /// Hand the liveness timer to the peer's record so `leave` cancels it
    ///
    /// If the peer is already gone the timer is cancelled right away.
    pub fn attach_liveness(&self, room_key: &str, identity: &str, session: u64, timer: AbortHandle) -> bool {
        let mut rooms = self.rooms.lock();
        match Self::record_mut(&mut rooms, room_key, identity, session) {
            Some(record) => {
                record.cancel_liveness();
                record.liveness = Some(timer);
                true
            }
            None => {
                timer.abort();
                false
            }
        }
    }

    /// Change a peer's display name and tell the rest of the room
    pub fn rename(&self, room_key: &str, identity: &str, session: u64, display_name: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(record) = Self::record_mut(&mut rooms, room_key, identity, session) else {
            return false;
        };
        record.info.name.display_name = display_name.to_string();
        let peer = record.info.clone();

        if let Some(room) = rooms.get(room_key) {
            room.broadcast_except(identity, &ServerMessage::PeerModifyName { peer });
        }
        info!("Peer {} renamed to {}", identity, display_name);
        true
    }

    /// Current members of a room
    pub fn members(&self, room_key: &str) -> Vec<PeerInfo> {
        let rooms = self.rooms.lock();
        rooms
            .get(room_key)
            .map(|room| room.peers.values().map(|p| p.info.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Whether a room key is present
    pub fn has_room(&self, room_key: &str) -> bool {
        self.rooms.lock().contains_key(room_key)
    }

    fn record_mut<'a>(
        rooms: &'a mut HashMap<String, Room>,
        room_key: &str,
        identity: &str,
        session: u64,
    ) -> Option<&'a mut PeerRecord> {
        rooms
            .get_mut(room_key)
            .and_then(|room| room.peers.get_mut(identity))
            .filter(|record| record.handle.session() == session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DisplayMetadata;

    fn peer(
        registry: &RoomRegistry,
        id: &str,
    ) -> (PeerRecord, u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = registry.next_session();
        let info = PeerInfo {
            id: id.to_string(),
            name: DisplayMetadata {
                display_name: format!("{} name", id),
                device_name: "Test".to_string(),
            },
            rtc_supported: true,
        };
        let record = PeerRecord::new(info, "127.0.0.1".parse().unwrap(), PeerHandle::new(session, tx));
        (record, session, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Message::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn ids(peers: &[PeerInfo]) -> Vec<String> {
        let mut ids: Vec<String> = peers.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_join_returns_existing_members_without_self() {
        let registry = RoomRegistry::new();
        let (a, _, mut a_rx) = peer(&registry, "a");
        let (b, _, _b_rx) = peer(&registry, "b");
        let (c, _, _c_rx) = peer(&registry, "c");

        assert!(registry.join("local", a).is_empty());
        assert_eq!(ids(&registry.join("local", b)), vec!["a"]);
        assert_eq!(ids(&registry.join("local", c)), vec!["a", "b"]);

        let seen = drain(&mut a_rx);
        let joined: Vec<&str> = seen
            .iter()
            .filter(|m| m["type"] == "peer-joined")
            .map(|m| m["peer"]["id"].as_str().unwrap())
            .collect();
        assert_eq!(joined, vec!["b", "c"]);
    }

    #[test]
    fn test_empty_rooms_never_linger() {
        let registry = RoomRegistry::new();
        let (a, a_session, _a_rx) = peer(&registry, "a");
        let (b, b_session, mut b_rx) = peer(&registry, "b");

        registry.join("local", a);
        registry.join("local", b);
        assert!(registry.has_room("local"));

        assert!(registry.leave("local", "a", a_session));
        assert!(registry.has_room("local"));
        let left: Vec<Value> = drain(&mut b_rx);
        assert!(left.iter().any(|m| m["type"] == "peer-left" && m["peerId"] == "a"));

        assert!(registry.leave("local", "b", b_session));
        assert!(!registry.has_room("local"));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let registry = RoomRegistry::new();
        let (a, session, _rx) = peer(&registry, "a");
        registry.join("local", a);

        assert!(registry.leave("local", "a", session));
        assert!(!registry.leave("local", "a", session));
        assert!(!registry.leave("elsewhere", "a", session));
    }

    #[test]
    fn test_stale_session_cannot_remove_reconnected_peer() {
        let registry = RoomRegistry::new();
        let (old, old_session, mut old_rx) = peer(&registry, "a");
        let (other, _, _other_rx) = peer(&registry, "b");
        registry.join("local", old);
        registry.join("local", other);

        let (fresh, fresh_session, _fresh_rx) = peer(&registry, "a");
        let existing = registry.join("local", fresh);
        assert_eq!(ids(&existing), vec!["b"]);

        // The replaced socket was asked to close
        let mut closed = false;
        while let Ok(frame) = old_rx.try_recv() {
            closed |= matches!(frame, Message::Close(_));
        }
        assert!(closed);

        assert!(!registry.leave("local", "a", old_session));
        assert_eq!(ids(&registry.members("local")), vec!["a", "b"]);
        assert!(registry.leave("local", "a", fresh_session));
    }

    #[test]
    fn test_route_strips_to_and_stamps_sender() {
        let registry = RoomRegistry::new();
        let (a, _, _a_rx) = peer(&registry, "a");
        let (b, _, mut b_rx) = peer(&registry, "b");
        registry.join("local", a);
        registry.join("local", b);

        let envelope = serde_json::json!({"type": "signal", "to": "b", "sdp": {"type": "offer", "sdp": "v=0"}});
        assert!(registry.route("local", "a", envelope));

        let delivered = drain(&mut b_rx);
        let signal = delivered.iter().find(|m| m["type"] == "signal").unwrap();
        assert_eq!(signal["sender"], "a");
        assert!(signal.get("to").is_none());
        assert_eq!(signal["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn test_route_to_unknown_peer_is_dropped() {
        let registry = RoomRegistry::new();
        let (a, _, _a_rx) = peer(&registry, "a");
        registry.join("local", a);

        assert!(!registry.route("local", "a", serde_json::json!({"type": "signal", "to": "ghost"})));
        assert!(!registry.route("local", "a", serde_json::json!({"type": "signal"})));
        assert!(!registry.route("local", "a", serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn test_route_does_not_cross_rooms() {
        let registry = RoomRegistry::new();
        let (a, _, _a_rx) = peer(&registry, "a");
        let (b, _, _b_rx) = peer(&registry, "b");
        registry.join("10.0.0.1", a);
        registry.join("10.0.0.2", b);

        assert!(!registry.route("10.0.0.1", "a", serde_json::json!({"type": "text", "to": "b"})));
    }

    #[test]
    fn test_route_chunk_swaps_identity() {
        let registry = RoomRegistry::new();
        let (a, _, _a_rx) = peer(&registry, "a");
        let (b, _, mut b_rx) = peer(&registry, "b");
        registry.join("local", a);
        registry.join("local", b);
        while b_rx.try_recv().is_ok() {}

        let frame = encode_routed_chunk("b", &[1, 2, 3]).unwrap();
        assert!(registry.route_chunk("local", "a", &frame));

        match b_rx.try_recv().unwrap() {
            Message::Binary(bytes) => {
                let (from, chunk) = decode_routed_chunk(&bytes).unwrap();
                assert_eq!(from, "a");
                assert_eq!(chunk, &[1, 2, 3]);
            }
            other => panic!("Expected binary frame, got {:?}", other),
        }
    }

    #[test]
    fn test_rename_broadcasts_to_others() {
        let registry = RoomRegistry::new();
        let (a, a_session, mut a_rx) = peer(&registry, "a");
        let (b, _, mut b_rx) = peer(&registry, "b");
        registry.join("local", a);
        registry.join("local", b);
        drain(&mut a_rx);

        assert!(registry.rename("local", "a", a_session, "Renamed"));
        let seen = drain(&mut b_rx);
        let modified = seen.iter().find(|m| m["type"] == "peer-modify-name").unwrap();
        assert_eq!(modified["peer"]["name"]["displayName"], "Renamed");
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_cancels_liveness_timer() {
        let registry = RoomRegistry::new();
        let (a, session, _rx) = peer(&registry, "a");
        registry.join("local", a);

        let timer = tokio::spawn(std::future::pending::<()>());
        assert!(registry.attach_liveness("local", "a", session, timer.abort_handle()));
        registry.leave("local", "a", session);

        let err = timer.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
