//! Client session
//!
//! Owns the signaling connection and one entry per remote peer: a transfer
//! engine plus its delivery path (a direct link or the relay). Server
//! messages, relayed peer frames and local commands are all handled on one
//! task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::{
    Capability, Incoming, NetworkError, SignalingConnection, SignalingReceiver, SignalingSender,
};
use crate::protocol::{decode_routed_chunk, ClientMessage, PeerInfo, ServerMessage};
use crate::transfer::{OutgoingFile, TransferConfig, TransferEngine, TransferEvent, TransferHandle};

use super::channel::{ChannelFrame, PeerChannel};
use super::directory::PeerDirectory;
use super::fallback::RelayChannel;
use super::negotiator::NegotiationState;
use super::rtc::{RemoteSignal, RtcLink, RtcSettings};

/// Upper bound on waiting for the server to close after a shutdown
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capability: Capability,
    pub transfer: TransferConfig,
    pub rtc: RtcSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capability: Capability::DirectChannel,
            transfer: TransferConfig::default(),
            rtc: RtcSettings::default(),
        }
    }
}

/// What the session reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The server announced our own name and identity
    Welcome {
        identity: Option<String>,
        display_name: String,
        device_name: String,
    },
    Peers(Vec<PeerInfo>),
    PeerJoined(PeerInfo),
    PeerLeft(String),
    PeerRenamed(PeerInfo),
    LinkState {
        peer: String,
        state: NegotiationState,
    },
    Transfer(TransferEvent),
    /// The signaling connection is gone
    Disconnected,
}

#[derive(Debug)]
enum SessionCommand {
    SendFiles { to: String, files: Vec<OutgoingFile> },
    SendText { to: String, text: String },
    Cancel { to: String },
    Connect { to: String },
    Rename(String),
    Shutdown,
}

/// Handle for driving a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    directory: PeerDirectory,
}

impl SessionHandle {
    /// Queue files for a peer
    pub fn send_files(&self, to: &str, files: Vec<OutgoingFile>) -> Result<(), NetworkError> {
        self.command(SessionCommand::SendFiles {
            to: to.to_string(),
            files,
        })
    }

    pub fn send_text(&self, to: &str, text: &str) -> Result<(), NetworkError> {
        self.command(SessionCommand::SendText {
            to: to.to_string(),
            text: text.to_string(),
        })
    }

    /// Cancel the transfer to a peer and drop its queue
    pub fn cancel(&self, to: &str) -> Result<(), NetworkError> {
        self.command(SessionCommand::Cancel { to: to.to_string() })
    }

    /// Open a direct channel ahead of any transfer
    pub fn connect(&self, to: &str) -> Result<(), NetworkError> {
        self.command(SessionCommand::Connect { to: to.to_string() })
    }

    /// Change our display name for the rest of the room
    pub fn rename(&self, display_name: &str) -> Result<(), NetworkError> {
        self.command(SessionCommand::Rename(display_name.to_string()))
    }

    /// Leave the room and stop the session
    pub fn shutdown(&self) -> Result<(), NetworkError> {
        self.command(SessionCommand::Shutdown)
    }

    /// Current view of the room
    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    fn command(&self, command: SessionCommand) -> Result<(), NetworkError> {
        self.tx.send(command).map_err(|_| NetworkError::NotConnected)
    }
}

enum Delivery {
    Direct(RtcLink),
    Relay,
}

struct PeerEntry {
    transfer: TransferHandle,
    delivery: Delivery,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerEntry {
    fn close(self) {
        if let Delivery::Direct(link) = &self.delivery {
            link.close();
        }
        // The link task stops on its own once it has closed the connection
        if let Some(engine) = self.tasks.first() {
            engine.abort();
        }
    }
}

/// Client-side manager of all remote peers in the room
pub struct PeersManager {
    config: SessionConfig,
    directory: PeerDirectory,
    signaling: SignalingSender,
    receiver: SignalingReceiver,
    peers: HashMap<String, PeerEntry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
    transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
}

impl PeersManager {
    /// Start a session on an open signaling connection
    pub fn spawn(
        connection: SignalingConnection,
        config: SessionConfig,
    ) -> (
        SessionHandle,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<()>,
    ) {
        let (signaling, receiver) = connection.split();
        let directory = PeerDirectory::new();
        let (tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let manager = Self {
            config,
            directory: directory.clone(),
            signaling,
            receiver,
            peers: HashMap::new(),
            events,
            transfer_tx,
            transfer_rx,
            commands,
        };
        let task = tokio::spawn(manager.run());
        (SessionHandle { tx, directory }, events_rx, task)
    }

    async fn run(mut self) {
        let mut closing = false;
        let linger = tokio::time::sleep(CLOSE_LINGER);
        tokio::pin!(linger);

        loop {
            tokio::select! {
                incoming = self.receiver.recv() => match incoming {
                    Ok(Incoming::Text(text)) => self.on_text(&text),
                    Ok(Incoming::Binary(frame)) => self.on_binary(&frame),
                    Err(e) => {
                        if closing {
                            debug!("Signaling connection closed");
                        } else {
                            info!("Signaling connection lost: {}", e);
                        }
                        break;
                    }
                },
                Some(command) = self.commands.recv(), if !closing => match command {
                    SessionCommand::Shutdown => {
                        // Wait for the server to close so the goodbye is flushed
                        if let Err(e) = self.signaling.send(&ClientMessage::Disconnect) {
                            warn!("Failed to send disconnect: {}", e);
                        }
                        self.signaling.close();
                        closing = true;
                        linger.as_mut().reset(Instant::now() + CLOSE_LINGER);
                    }
                    command => self.on_command(command),
                },
                Some(event) = self.transfer_rx.recv() => {
                    self.emit(SessionEvent::Transfer(event));
                }
                _ = &mut linger, if closing => {
                    debug!("Server did not close in time");
                    break;
                }
            }
        }

        for (_, entry) in self.peers.drain() {
            entry.close();
        }
        self.emit(SessionEvent::Disconnected);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn on_text(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                debug!("Dropping malformed server frame");
                return;
            }
        };
        let sender = value
            .get("sender")
            .and_then(Value::as_str)
            .map(str::to_string);

        match serde_json::from_value::<ServerMessage>(value) {
            Ok(ServerMessage::Peers { peers }) => self.on_peers(peers),
            Ok(ServerMessage::PeerJoined { peer }) => {
                info!("{} joined", peer.name.display_name);
                self.directory.upsert(peer.clone());
                self.emit(SessionEvent::PeerJoined(peer));
            }
            Ok(ServerMessage::PeerLeft { peer_id }) => self.on_peer_left(&peer_id),
            Ok(ServerMessage::Signal { sender, sdp, ice }) => {
                self.on_signal(&sender, RemoteSignal { sdp, ice })
            }
            Ok(ServerMessage::Ping) => {
                if let Err(e) = self.signaling.send(&ClientMessage::Pong) {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            Ok(ServerMessage::DisplayName { message }) => {
                info!("Known to the room as {}", message.display_name);
                self.directory.set_local(message.clone());
                self.emit(SessionEvent::Welcome {
                    identity: message.peer_id,
                    display_name: message.display_name,
                    device_name: message.device_name,
                });
            }
            Ok(ServerMessage::PeerModifyName { peer }) => {
                self.directory.upsert(peer.clone());
                self.emit(SessionEvent::PeerRenamed(peer));
            }
            Ok(ServerMessage::Unrecognized) => match sender {
                // A peer message that came through the relay
                Some(sender) => self.deliver(&sender, ChannelFrame::Control(text.to_string())),
                None => debug!("Unknown server message, dropped"),
            },
            Err(e) => debug!("Dropping invalid server message: {}", e),
        }
    }

    fn on_binary(&mut self, frame: &[u8]) {
        match decode_routed_chunk(frame) {
            Some((sender, chunk)) => {
                let sender = sender.to_string();
                self.deliver(&sender, ChannelFrame::Chunk(Bytes::copy_from_slice(chunk)));
            }
            None => debug!("Dropping malformed relayed chunk"),
        }
    }

    fn on_peers(&mut self, peers: Vec<PeerInfo>) {
        info!("{} peers in the room", peers.len());
        self.directory.replace(peers.clone());

        // The newcomer calls everyone already present
        for peer in &peers {
            let direct = self.wants_direct(&peer.id);
            let entry = self.entry(&peer.id, direct);
            if let Delivery::Direct(link) = &entry.delivery {
                link.connect();
            }
        }
        self.emit(SessionEvent::Peers(peers));
    }

    fn on_peer_left(&mut self, peer_id: &str) {
        if let Some(peer) = self.directory.remove(peer_id) {
            info!("{} left", peer.name.display_name);
        }
        if let Some(entry) = self.peers.remove(peer_id) {
            entry.close();
        }
        self.emit(SessionEvent::PeerLeft(peer_id.to_string()));
    }

    fn on_signal(&mut self, sender: &str, signal: RemoteSignal) {
        if !self.config.capability.supports_direct() {
            debug!("Ignoring signal from {}: direct channels disabled", sender);
            return;
        }
        match &self.entry(sender, true).delivery {
            Delivery::Direct(link) => link.signal(signal),
            Delivery::Relay => debug!("Ignoring signal from relay-only peer {}", sender),
        }
    }

    fn deliver(&mut self, sender: &str, frame: ChannelFrame) {
        let direct = self.wants_direct(sender);
        if let Err(e) = self.entry(sender, direct).transfer.deliver(frame) {
            warn!("Frame from {} dropped: {}", sender, e);
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SendFiles { to, files } => {
                self.warn_if_unknown(&to);
                let direct = self.wants_direct(&to);
                if let Err(e) = self.entry(&to, direct).transfer.enqueue(files) {
                    warn!("Failed to queue files for {}: {}", to, e);
                }
            }
            SessionCommand::SendText { to, text } => {
                self.warn_if_unknown(&to);
                let direct = self.wants_direct(&to);
                if let Err(e) = self.entry(&to, direct).transfer.send_text(text) {
                    warn!("Failed to send text to {}: {}", to, e);
                }
            }
            SessionCommand::Cancel { to } => match self.peers.get(&to) {
                Some(entry) => {
                    if let Err(e) = entry.transfer.cancel() {
                        warn!("Failed to cancel transfer to {}: {}", to, e);
                    }
                }
                None => debug!("Nothing to cancel for {}", to),
            },
            SessionCommand::Connect { to } => {
                let direct = self.wants_direct(&to);
                match &self.entry(&to, direct).delivery {
                    Delivery::Direct(link) => link.connect(),
                    Delivery::Relay => debug!("{} is reached through the relay", to),
                }
            }
            SessionCommand::Rename(display_name) => {
                if let Err(e) = self.signaling.send(&ClientMessage::PeerModifyName { display_name }) {
                    warn!("Failed to rename: {}", e);
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn warn_if_unknown(&self, peer: &str) {
        if self.directory.get(peer).is_none() {
            warn!("{} is not in the room; frames may be dropped", peer);
        }
    }

    /// Both sides must support direct channels to use one
    fn wants_direct(&self, peer: &str) -> bool {
        self.config.capability.supports_direct()
            && self.directory.get(peer).is_some_and(|p| p.rtc_supported)
    }

    /// Existing entry for `peer`, or a new one using the requested path
    fn entry(&mut self, peer: &str, direct: bool) -> &PeerEntry {
        if !self.peers.contains_key(peer) {
            let entry = self.open_peer(peer, direct);
            self.peers.insert(peer.to_string(), entry);
        }
        &self.peers[peer]
    }

    fn open_peer(&self, peer: &str, direct: bool) -> PeerEntry {
        if direct {
            debug!("Opening direct link to {}", peer);
            let (link, pending) = RtcLink::new(peer);
            let (transfer, engine_task) = TransferEngine::spawn(
                peer,
                link.channel(),
                self.directory.clone(),
                self.config.transfer,
                self.transfer_tx.clone(),
            );
            let link_task = pending.start(
                transfer.clone(),
                self.config.rtc.clone(),
                self.signaling.clone(),
                self.events.clone(),
            );
            PeerEntry {
                transfer,
                delivery: Delivery::Direct(link),
                tasks: vec![engine_task, link_task],
            }
        } else {
            debug!("Using the relay for {}", peer);
            let channel: Arc<dyn PeerChannel> =
                Arc::new(RelayChannel::new(peer, self.signaling.clone()));
            let (transfer, engine_task) = TransferEngine::spawn(
                peer,
                channel,
                self.directory.clone(),
                self.config.transfer,
                self.transfer_tx.clone(),
            );
            PeerEntry {
                transfer,
                delivery: Delivery::Relay,
                tasks: vec![engine_task],
            }
        }
    }
}
