//! Connection negotiation state machine
//!
//! Pure transition table for one remote peer. The direct-channel link feeds
//! it events and performs the returned actions; nothing here touches the
//! network.
//!
//! ```text
//!            Connect                 ChannelOpened
//!   Idle ──────────────► Negotiating ─────────────► ChannelOpen
//!     │  RemoteSignal     (caller|callee)                │
//!     └──────────────────────►  ▲                        │ ChannelClosed
//!                               │ Reconnect (caller)     │ ConnectionFailed
//!                               │ RemoteSignal           │ NegotiationError
//!                               │ SendRequested          ▼
//!                               └──────────────────── Closed
//! ```

use std::fmt;

/// Which side created the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Negotiation state of one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// No connection object yet
    #[default]
    Idle,
    /// Offer/answer exchange in progress
    Negotiating(Role),
    /// Data channel is usable
    ChannelOpen,
    /// Connection torn down
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Idle => write!(f, "idle"),
            NegotiationState::Negotiating(Role::Caller) => write!(f, "negotiating (caller)"),
            NegotiationState::Negotiating(Role::Callee) => write!(f, "negotiating (callee)"),
            NegotiationState::ChannelOpen => write!(f, "open"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// Local side wants a channel to the peer
    Connect,
    /// A description or candidate arrived from the peer
    RemoteSignal,
    ChannelOpened,
    ChannelClosed,
    ConnectionFailed,
    NegotiationError,
    /// Follow-up emitted after a caller-side failure
    Reconnect,
    /// Something needs to be sent; re-establish if down
    SendRequested,
}

/// Side effects the link must perform, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    OpenConnection,
    /// Create the data channel and an offer, send it as a signal
    CreateOffer,
    /// Apply the signal that triggered the transition
    ApplySignal,
    TearDown,
}

/// Result of feeding one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: NegotiationState,
    pub actions: Vec<Action>,
    pub follow_up: Option<NegotiationEvent>,
}

impl Transition {
    fn to(next: NegotiationState, actions: &[Action]) -> Self {
        Self {
            next,
            actions: actions.to_vec(),
            follow_up: None,
        }
    }

    fn stay(state: NegotiationState) -> Self {
        Self::to(state, &[])
    }
}

/// The transition table
///
/// `role` is the role recorded by the last negotiation, if any.
pub fn transition(state: NegotiationState, role: Option<Role>, event: NegotiationEvent) -> Transition {
    use Action::*;
    use NegotiationEvent::*;
    use NegotiationState::*;

    match (state, event) {
        (Idle, Connect) | (Closed, Connect) => {
            Transition::to(Negotiating(Role::Caller), &[OpenConnection, CreateOffer])
        }
        (Negotiating(_) | ChannelOpen, Connect) => Transition::stay(state),

        (Idle, RemoteSignal) => {
            Transition::to(Negotiating(Role::Callee), &[OpenConnection, ApplySignal])
        }
        (Negotiating(_) | ChannelOpen, RemoteSignal) => Transition::to(state, &[ApplySignal]),
        (Closed, RemoteSignal) => Transition::to(
            Negotiating(role.unwrap_or(Role::Callee)),
            &[OpenConnection, ApplySignal],
        ),

        (Negotiating(_), ChannelOpened) => Transition::to(ChannelOpen, &[]),
        (Idle | ChannelOpen | Closed, ChannelOpened) => Transition::stay(state),

        (Negotiating(_) | ChannelOpen, ChannelClosed | ConnectionFailed | NegotiationError) => {
            Transition {
                next: Closed,
                actions: vec![TearDown],
                follow_up: (role == Some(Role::Caller)).then_some(Reconnect),
            }
        }
        (Idle | Closed, ChannelClosed | ConnectionFailed | NegotiationError) => Transition::stay(state),

        (Closed, Reconnect) if role == Some(Role::Caller) => {
            Transition::to(Negotiating(Role::Caller), &[OpenConnection, CreateOffer])
        }
        (_, Reconnect) => Transition::stay(state),

        (Negotiating(_) | ChannelOpen, SendRequested) => Transition::stay(state),
        (Idle, SendRequested) => {
            Transition::to(Negotiating(Role::Caller), &[OpenConnection, CreateOffer])
        }
        (Closed, SendRequested) => match role {
            Some(Role::Callee) => Transition::to(Negotiating(Role::Callee), &[OpenConnection]),
            _ => Transition::to(Negotiating(Role::Caller), &[OpenConnection, CreateOffer]),
        },
    }
}

/// Connection state for one remote peer
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    state: NegotiationState,
    role: Option<Role>,
    reconnect_pending: bool,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// True between a caller-side failure and the reconnect attempt
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn is_open(&self) -> bool {
        self.state == NegotiationState::ChannelOpen
    }

    /// Feed an event, update the state and return what to do
    pub fn handle(&mut self, event: NegotiationEvent) -> Transition {
        let transition = transition(self.state, self.role, event);

        if let NegotiationState::Negotiating(role) = transition.next {
            self.role = Some(role);
        }
        if event == NegotiationEvent::Reconnect {
            self.reconnect_pending = false;
        }
        if transition.follow_up == Some(NegotiationEvent::Reconnect) {
            self.reconnect_pending = true;
        }
        self.state = transition.next;
        transition
    }
}
