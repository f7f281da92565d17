//! Known peers of the current room, plus this peer's own name

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::{DisplayNameInfo, PeerInfo};

#[derive(Debug, Default)]
struct DirectoryState {
    local: Option<DisplayNameInfo>,
    peers: HashMap<String, PeerInfo>,
}

/// Shared view of the room, updated from server messages
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<Mutex<DirectoryState>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what the server told us about ourselves
    pub fn set_local(&self, info: DisplayNameInfo) {
        self.inner.lock().local = Some(info);
    }

    /// Our display name, once the server announced it
    pub fn local_name(&self) -> Option<String> {
        self.inner.lock().local.as_ref().map(|l| l.display_name.clone())
    }

    /// Our identity, once the server announced it
    pub fn local_identity(&self) -> Option<String> {
        self.inner.lock().local.as_ref().and_then(|l| l.peer_id.clone())
    }

    /// Replace the whole room view
    pub fn replace(&self, peers: Vec<PeerInfo>) {
        let mut state = self.inner.lock();
        state.peers = peers.into_iter().map(|p| (p.id.clone(), p)).collect();
    }

    /// Add or update one peer
    pub fn upsert(&self, peer: PeerInfo) {
        self.inner.lock().peers.insert(peer.id.clone(), peer);
    }

    pub fn remove(&self, identity: &str) -> Option<PeerInfo> {
        self.inner.lock().peers.remove(identity)
    }

    pub fn get(&self, identity: &str) -> Option<PeerInfo> {
        self.inner.lock().peers.get(identity).cloned()
    }

    /// Display name of a known peer
    pub fn display_name(&self, identity: &str) -> Option<String> {
        self.inner
            .lock()
            .peers
            .get(identity)
            .map(|p| p.name.display_name.clone())
    }

    /// Peers sorted by display name
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.inner.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.display_name.cmp(&b.name.display_name));
        peers
    }

    /// Find a peer by identity or case-insensitive display name
    pub fn find(&self, needle: &str) -> Option<PeerInfo> {
        let state = self.inner.lock();
        state.peers.get(needle).cloned().or_else(|| {
            state
                .peers
                .values()
                .find(|p| p.name.display_name.eq_ignore_ascii_case(needle))
                .cloned()
        })
    }
}
