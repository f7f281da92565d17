//! Client-side peer handling
//!
//! Per remote peer: a negotiation state machine, a delivery path (direct
//! data channel or relay), and a transfer engine on top of it.

mod channel;
mod directory;
mod fallback;
mod manager;
mod negotiator;
mod rtc;

pub use channel::{ChannelFrame, PeerChannel};
pub use directory::PeerDirectory;
pub use fallback::RelayChannel;
pub use manager::{PeersManager, SessionConfig, SessionEvent, SessionHandle};
pub use negotiator::{transition, Action, NegotiationEvent, NegotiationState, Negotiator, Role, Transition};
pub use rtc::{IceServer, PendingLink, RemoteSignal, RtcLink, RtcSettings, DATA_CHANNEL_LABEL, DEFAULT_STUN_SERVER};
