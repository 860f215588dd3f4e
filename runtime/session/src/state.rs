//! Session state machine
//!
//! A session carries three state variables. `global` tracks the
//! configure/terminate lifecycle; `client` tracks the request this side
//! issued; `server` tracks the request this side must answer. The client
//! and server sub-states are only meaningful while `global` is
//! `Configured`, and are `Null` otherwise.
//!
//! ```text
//! global: Null -CONFIG-> ConfigWaiting -CONFIG_ACK(0)-> Configured -TERM-> TermWaiting -TERM_ACK-> Null
//!                        ConfigWaiting -CONFIG_ACK(!0)-> Null
//! client: Idle -REQUEST-> Waiting -RESPONSE-> Notified -fetch-> Idle
//!                         Waiting -CANCEL-> CancelWaiting -CANCEL_ACK-> Idle
//!                                           CancelWaiting -RESPONSE-> Notified
//! server: Idle -recv REQUEST-> Notified -fetch-> Busy -RESPONSE-> Idle
//!                              Notified -recv CANCEL-> Idle (+ CANCEL_ACK)
//! ```
//!
//! This module is pure: it decides transitions and reports what the caller
//! must do about them (store a payload, reply, wake waiters). It never
//! touches shared memory.

use ree_ipc::Action;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalState {
    Null,
    ConfigWaiting,
    Configured,
    TermWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Null,
    Idle,
    Waiting,
    CancelWaiting,
    Notified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Null,
    Idle,
    Notified,
    Busy,
}

/// What the dispatcher must do after a received message was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Unexpected for the current state; nothing changed
    Drop,
    /// Configuration settled; status 0 means configured
    ConfigAcked { status: u32 },
    /// A request arrived and must be stored
    RequestArrived,
    /// The unfetched request was withdrawn; reply CANCEL_ACK
    RequestCancelled,
    /// A response arrived and must be stored
    ResponseArrived,
    /// Our cancel was acknowledged without a response
    CancelAcked,
    /// Peer closed the session; reply TERM_ACK and tear down
    PeerTerminated,
    /// Our TERM was acknowledged
    TermAcked,
    /// Both sides sent TERM; reply TERM_ACK, termination is complete
    TermCrossed,
}

impl Reaction {
    /// Message to send back to the peer, if any
    pub fn reply(self) -> Option<Action> {
        match self {
            Reaction::RequestCancelled => Some(Action::CancelAck),
            Reaction::PeerTerminated | Reaction::TermCrossed => Some(Action::TermAck),
            _ => None,
        }
    }
}

/// The three state variables of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionState {
    pub global: GlobalState,
    pub client: ClientState,
    pub server: ServerState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::NULL
    }
}

impl SessionState {
    pub const NULL: SessionState = SessionState {
        global: GlobalState::Null,
        client: ClientState::Null,
        server: ServerState::Null,
    };

    const CONFIGURED: SessionState = SessionState {
        global: GlobalState::Configured,
        client: ClientState::Idle,
        server: ServerState::Idle,
    };

    pub fn is_configured(&self) -> bool {
        self.global == GlobalState::Configured
    }

    /// Apply a message received from the peer
    ///
    /// `status` is the `p1` field, only consulted for CONFIG_ACK.
    pub fn receive(&mut self, action: Action, status: u32) -> Reaction {
        use ClientState as C;
        use GlobalState as G;
        use ServerState as S;

        match (self.global, self.client, self.server, action) {
            (G::ConfigWaiting, _, _, Action::ConfigAck) => {
                *self = if status == 0 {
                    Self::CONFIGURED
                } else {
                    Self::NULL
                };
                Reaction::ConfigAcked { status }
            }
            (G::TermWaiting, _, _, Action::TermAck) => {
                *self = Self::NULL;
                Reaction::TermAcked
            }
            (G::TermWaiting, _, _, Action::Term) => {
                *self = Self::NULL;
                Reaction::TermCrossed
            }
            (G::Configured, _, _, Action::Term) => {
                *self = Self::NULL;
                Reaction::PeerTerminated
            }
            (G::Configured, _, S::Idle, Action::Request) => {
                self.server = S::Notified;
                Reaction::RequestArrived
            }
            (G::Configured, _, S::Notified, Action::Cancel) => {
                self.server = S::Idle;
                Reaction::RequestCancelled
            }
            (G::Configured, C::Waiting | C::CancelWaiting, _, Action::Response) => {
                self.client = C::Notified;
                Reaction::ResponseArrived
            }
            (G::Configured, C::CancelWaiting, _, Action::CancelAck) => {
                self.client = C::Idle;
                Reaction::CancelAcked
            }
            _ => Reaction::Drop,
        }
    }

    /// NULL -> CONFIG_WAITING before sending CONFIG
    pub fn begin_config(&mut self) -> Result<()> {
        match self.global {
            GlobalState::Null => {
                self.global = GlobalState::ConfigWaiting;
                Ok(())
            }
            _ => Err(SessionError::AlreadyConfigured),
        }
    }

    /// Client IDLE -> WAITING before sending REQUEST
    pub fn begin_request(&mut self) -> Result<()> {
        self.require_configured()?;
        match self.client {
            ClientState::Idle => {
                self.client = ClientState::Waiting;
                Ok(())
            }
            _ => Err(self.violation("send_request")),
        }
    }

    /// Client NOTIFIED -> IDLE when the response is fetched
    pub fn take_response(&mut self) -> Result<()> {
        match self.client {
            ClientState::Notified => {
                self.client = ClientState::Idle;
                Ok(())
            }
            _ => Err(SessionError::NoResponse),
        }
    }

    /// Client WAITING -> CANCEL_WAITING before sending CANCEL
    pub fn begin_cancel(&mut self) -> Result<()> {
        self.require_configured()?;
        match self.client {
            ClientState::Waiting => {
                self.client = ClientState::CancelWaiting;
                Ok(())
            }
            _ => Err(SessionError::NoPendingRequest),
        }
    }

    /// Server NOTIFIED -> BUSY when the request is fetched
    pub fn take_request(&mut self) -> Result<()> {
        match self.server {
            ServerState::Notified => {
                self.server = ServerState::Busy;
                Ok(())
            }
            _ => Err(SessionError::NoRequest),
        }
    }

    /// Server BUSY -> IDLE before sending RESPONSE
    pub fn begin_response(&mut self) -> Result<()> {
        self.require_configured()?;
        match self.server {
            ServerState::Busy => {
                self.server = ServerState::Idle;
                Ok(())
            }
            _ => Err(self.violation("send_response")),
        }
    }

    /// CONFIG_WAITING or CONFIGURED -> TERM_WAITING before sending TERM
    ///
    /// Returns `false` when there is nothing to terminate.
    pub fn begin_term(&mut self) -> bool {
        match self.global {
            GlobalState::ConfigWaiting | GlobalState::Configured => {
                *self = SessionState {
                    global: GlobalState::TermWaiting,
                    client: ClientState::Null,
                    server: ServerState::Null,
                };
                true
            }
            _ => false,
        }
    }

    /// Force everything back to NULL
    pub fn teardown(&mut self) {
        *self = Self::NULL;
    }

    pub fn require_configured(&self) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(SessionError::NotConfigured)
        }
    }

    pub(crate) fn violation(&self, op: &'static str) -> SessionError {
        SessionError::ProtocolViolation { op, state: *self }
    }
}
