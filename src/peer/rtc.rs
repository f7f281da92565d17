//! Direct channel over a WebRTC data channel
//!
//! One link task per remote peer owns the peer connection and the
//! [`Negotiator`]. Substrate callbacks never touch link state directly: they
//! post events back to the task, tagged with the connection generation so
//! that events from a torn-down connection are ignored.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::network::{NetworkError, SignalingSender};
use crate::protocol::SignalEnvelope;
use crate::transfer::TransferHandle;

use super::channel::{ChannelFrame, PeerChannel};
use super::manager::SessionEvent;
use super::negotiator::{Action, NegotiationEvent, NegotiationState, Negotiator};

/// Label of the data channel
pub const DATA_CHANNEL_LABEL: &str = "data-channel";

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Delay before a caller retries after a failure
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A STUN or TURN server handed to ICE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }

    /// TURN relays need a username and credential
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Direct channel settings
#[derive(Debug, Clone)]
pub struct RtcSettings {
    pub ice_servers: Vec<IceServer>,
    pub reconnect_delay: Duration,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Connection-setup payload relayed from the remote peer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSignal {
    pub sdp: Option<Value>,
    pub ice: Option<Value>,
}

enum SubstrateEvent {
    DataChannel(Arc<RTCDataChannel>),
    ChannelOpened,
    ChannelClosed,
    ConnectionFailed,
}

impl fmt::Debug for SubstrateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateEvent::DataChannel(dc) => write!(f, "DataChannel({})", dc.label()),
            SubstrateEvent::ChannelOpened => write!(f, "ChannelOpened"),
            SubstrateEvent::ChannelClosed => write!(f, "ChannelClosed"),
            SubstrateEvent::ConnectionFailed => write!(f, "ConnectionFailed"),
        }
    }
}

#[derive(Debug)]
enum LinkCommand {
    Connect,
    Signal(RemoteSignal),
    Send(ChannelFrame),
    Reconnect,
    Substrate { generation: u64, event: SubstrateEvent },
    Close,
}

/// Handle to a direct-channel link task
#[derive(Debug, Clone)]
pub struct RtcLink {
    peer: String,
    tx: mpsc::UnboundedSender<LinkCommand>,
}

/// A link whose task has not been started yet
pub struct PendingLink {
    peer: String,
    tx: mpsc::UnboundedSender<LinkCommand>,
    rx: mpsc::UnboundedReceiver<LinkCommand>,
}

impl RtcLink {
    /// Create a link handle; start the task with [`PendingLink::start`]
    ///
    /// The split lets the transfer engine be built on [`RtcLink::channel`]
    /// before the task that delivers into it exists.
    pub fn new(peer: impl Into<String>) -> (Self, PendingLink) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peer: peer.clone(),
                tx: tx.clone(),
            },
            PendingLink { peer, tx, rx },
        )
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Start negotiating as the caller
    pub fn connect(&self) {
        let _ = self.tx.send(LinkCommand::Connect);
    }

    /// Apply a relayed description or candidate
    pub fn signal(&self, signal: RemoteSignal) {
        let _ = self.tx.send(LinkCommand::Signal(signal));
    }

    /// Tear the connection down and stop the task
    pub fn close(&self) {
        let _ = self.tx.send(LinkCommand::Close);
    }

    /// Delivery path for the transfer engine
    pub fn channel(&self) -> Arc<dyn PeerChannel> {
        Arc::new(RtcChannel {
            tx: self.tx.clone(),
        })
    }
}

impl PendingLink {
    /// Start the link task
    pub fn start(
        self,
        engine: TransferHandle,
        settings: RtcSettings,
        signaling: SignalingSender,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> JoinHandle<()> {
        let task = LinkTask {
            peer: self.peer,
            negotiator: Negotiator::new(),
            settings,
            signaling,
            engine,
            events,
            commands: self.tx.downgrade(),
            generation: 0,
            pc: None,
            dc: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            pending_frames: VecDeque::new(),
        };
        drop(self.tx);
        tokio::spawn(task.run(self.rx))
    }
}

/// [`PeerChannel`] that hands frames to the link task
struct RtcChannel {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

#[async_trait]
impl PeerChannel for RtcChannel {
    async fn send(&self, frame: ChannelFrame) -> Result<(), NetworkError> {
        self.tx
            .send(LinkCommand::Send(frame))
            .map_err(|_| NetworkError::ChannelClosed)
    }

    fn kind(&self) -> &'static str {
        "direct"
    }
}

struct LinkTask {
    peer: String,
    negotiator: Negotiator,
    settings: RtcSettings,
    signaling: SignalingSender,
    engine: TransferHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::WeakUnboundedSender<LinkCommand>,
    generation: u64,
    pc: Option<Arc<RTCPeerConnection>>,
    dc: Option<Arc<RTCDataChannel>>,
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
    pending_frames: VecDeque<ChannelFrame>,
}

impl LinkTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LinkCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LinkCommand::Connect => self.dispatch(NegotiationEvent::Connect, None).await,
                LinkCommand::Signal(signal) => {
                    self.dispatch(NegotiationEvent::RemoteSignal, Some(&signal))
                        .await
                }
                LinkCommand::Send(frame) => self.send(frame).await,
                LinkCommand::Reconnect => self.dispatch(NegotiationEvent::Reconnect, None).await,
                LinkCommand::Substrate { generation, event } => {
                    if generation != self.generation {
                        trace!("Stale substrate event for {}: {:?}", self.peer, event);
                        continue;
                    }
                    self.on_substrate(event).await;
                }
                LinkCommand::Close => break,
            }
        }
        self.tear_down().await;
        debug!("Link to {} stopped", self.peer);
    }

    async fn on_substrate(&mut self, event: SubstrateEvent) {
        match event {
            SubstrateEvent::DataChannel(dc) => {
                debug!("Data channel from {}: {}", self.peer, dc.label());
                self.dc = Some(dc);
            }
            SubstrateEvent::ChannelOpened => {
                self.dispatch(NegotiationEvent::ChannelOpened, None).await;
            }
            SubstrateEvent::ChannelClosed => {
                self.dispatch(NegotiationEvent::ChannelClosed, None).await;
            }
            SubstrateEvent::ConnectionFailed => {
                self.dispatch(NegotiationEvent::ConnectionFailed, None).await;
            }
        }
    }

    /// Feed an event to the negotiator and carry out the resulting actions
    async fn dispatch(&mut self, event: NegotiationEvent, signal: Option<&RemoteSignal>) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let before = self.negotiator.state();
            let transition = self.negotiator.handle(event);

            for action in &transition.actions {
                if let Err(e) = self.perform(*action, signal).await {
                    warn!("Negotiation with {} failed: {}", self.peer, e);
                    next = Some(NegotiationEvent::NegotiationError);
                    break;
                }
            }

            let after = self.negotiator.state();
            if before != after {
                debug!("Link to {}: {} -> {} on {:?}", self.peer, before, after, event);
                let _ = self.events.send(SessionEvent::LinkState {
                    peer: self.peer.clone(),
                    state: after,
                });
            }
            if after == NegotiationState::ChannelOpen && before != after {
                info!("Direct channel to {} open", self.peer);
                self.flush().await;
            }

            if next.is_none() && transition.follow_up == Some(NegotiationEvent::Reconnect) {
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&self) {
        let commands = self.commands.clone();
        let delay = self.settings.reconnect_delay;
        info!("Reconnecting to {} in {:?}", self.peer, delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(LinkCommand::Reconnect);
            }
        });
    }

    async fn perform(&mut self, action: Action, signal: Option<&RemoteSignal>) -> Result<(), NetworkError> {
        match action {
            Action::OpenConnection => self.open_connection().await,
            Action::CreateOffer => self.create_offer().await,
            Action::ApplySignal => match signal {
                Some(signal) => self.apply_signal(signal).await,
                None => Ok(()),
            },
            Action::TearDown => {
                self.tear_down().await;
                Ok(())
            }
        }
    }

    async fn open_connection(&mut self) -> Result<(), NetworkError> {
        self.tear_down().await;
        self.generation += 1;
        let generation = self.generation;

        let pc = build_peer_connection(&self.settings).await?;

        let signaling = self.signaling.clone();
        let peer = self.peer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = signaling.clone();
            let peer = peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let sent = candidate
                    .to_json()
                    .map_err(NetworkError::from)
                    .and_then(|init| Ok(serde_json::to_value(init)?))
                    .and_then(|ice| signaling.send(&SignalEnvelope::ice(&peer, ice)));
                if let Err(e) = sent {
                    warn!("Failed to send candidate to {}: {}", peer, e);
                }
            })
        }));

        let commands = self.commands.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let commands = commands.clone();
            Box::pin(async move {
                let event = match state {
                    RTCPeerConnectionState::Failed => SubstrateEvent::ConnectionFailed,
                    RTCPeerConnectionState::Disconnected => SubstrateEvent::ChannelClosed,
                    _ => return,
                };
                post(&commands, generation, event);
            })
        }));

        // Handlers go on before the callback returns and the read loop starts
        let commands = self.commands.clone();
        let engine = self.engine.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            wire_data_channel(&dc, generation, &commands, &engine);
            let commands = commands.clone();
            Box::pin(async move {
                post(&commands, generation, SubstrateEvent::DataChannel(dc));
            })
        }));

        self.pc = Some(pc);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<(), NetworkError> {
        let pc = self.connection()?;
        let dc = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        wire_data_channel(&dc, self.generation, &self.commands, &self.engine);
        self.dc = Some(dc);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        self.send_local_description(&pc).await
    }

    async fn apply_signal(&mut self, signal: &RemoteSignal) -> Result<(), NetworkError> {
        let pc = self.connection()?;

        if let Some(sdp) = &signal.sdp {
            let description: RTCSessionDescription = serde_json::from_value(sdp.clone())?;
            let is_offer = description.sdp_type == RTCSdpType::Offer;
            pc.set_remote_description(description).await?;
            self.remote_description_set = true;

            for candidate in std::mem::take(&mut self.pending_candidates) {
                pc.add_ice_candidate(candidate).await?;
            }

            if is_offer {
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer).await?;
                self.send_local_description(&pc).await?;
            }
        }

        if let Some(ice) = &signal.ice {
            let candidate: RTCIceCandidateInit = serde_json::from_value(ice.clone())?;
            if self.remote_description_set {
                pc.add_ice_candidate(candidate).await?;
            } else {
                self.pending_candidates.push(candidate);
            }
        }
        Ok(())
    }

    async fn send_local_description(&self, pc: &RTCPeerConnection) -> Result<(), NetworkError> {
        let description = pc
            .local_description()
            .await
            .ok_or_else(|| NetworkError::SignalingError("No local description".to_string()))?;
        let sdp = serde_json::to_value(description)?;
        self.signaling.send(&SignalEnvelope::sdp(&self.peer, sdp))
    }

    fn connection(&self) -> Result<Arc<RTCPeerConnection>, NetworkError> {
        self.pc.clone().ok_or(NetworkError::NotConnected)
    }

    async fn tear_down(&mut self) {
        self.dc = None;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                debug!("Closing connection to {}: {}", self.peer, e);
            }
        }
    }

    async fn send(&mut self, frame: ChannelFrame) {
        self.dispatch(NegotiationEvent::SendRequested, None).await;
        self.pending_frames.push_back(frame);
        if self.negotiator.is_open() {
            self.flush().await;
        }
    }

    /// Send buffered frames in order while the channel is open
    async fn flush(&mut self) {
        let Some(dc) = self.dc.clone() else {
            return;
        };
        while let Some(frame) = self.pending_frames.pop_front() {
            if dc.ready_state() != RTCDataChannelState::Open {
                self.pending_frames.push_front(frame);
                return;
            }
            let sent = match &frame {
                ChannelFrame::Control(json) => dc.send_text(json.clone()).await,
                ChannelFrame::Chunk(chunk) => dc.send(chunk).await,
            };
            if let Err(e) = sent {
                warn!("Send to {} failed: {}", self.peer, e);
            }
        }
    }
}

fn post(commands: &mpsc::WeakUnboundedSender<LinkCommand>, generation: u64, event: SubstrateEvent) {
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(LinkCommand::Substrate { generation, event });
    }
}

/// Install open/close/message handlers on a data channel
fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
    generation: u64,
    commands: &mpsc::WeakUnboundedSender<LinkCommand>,
    engine: &TransferHandle,
) {
    let on_open = commands.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            post(&on_open, generation, SubstrateEvent::ChannelOpened);
        })
    }));

    let on_close = commands.clone();
    dc.on_close(Box::new(move || {
        let on_close = on_close.clone();
        Box::pin(async move {
            post(&on_close, generation, SubstrateEvent::ChannelClosed);
        })
    }));

    let engine = engine.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let engine = engine.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelFrame::Control(text),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 text frame from {}", engine.peer());
                        return;
                    }
                }
            } else {
                ChannelFrame::Chunk(msg.data)
            };
            if engine.deliver(frame).is_err() {
                debug!("Transfer engine for {} gone, frame dropped", engine.peer());
            }
        })
    }));
}

async fn build_peer_connection(settings: &RtcSettings) -> Result<Arc<RTCPeerConnection>, NetworkError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: settings.ice_servers.iter().map(IceServer::to_rtc).collect(),
        ..Default::default()
    };

    let pc = api.new_peer_connection(config).await?;
    Ok(Arc::new(pc))
}
