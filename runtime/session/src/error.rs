//! Session error types
//!
//! Errors fall into four groups: structural (bad handle, wrong state,
//! malformed input), transient (no free slot, out of pages, interrupted),
//! timeouts, and peer-initiated teardown (`PipeBroken`). Protocol
//! violations by the peer never surface here; they are dropped at dispatch.

use ree_ipc::IpcError;
use thiserror::Error;

use crate::state::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid or closed session handle")]
    InvalidSession,

    #[error("peer has not completed the handshake")]
    NotReady,

    #[error("channel is shut down")]
    ShutDown,

    #[error("no free session slot")]
    NoFreeSession,

    #[error("session is not configured")]
    NotConfigured,

    #[error("session is already configured")]
    AlreadyConfigured,

    #[error("operation `{op}` not allowed in state {state:?}")]
    ProtocolViolation {
        op: &'static str,
        state: SessionState,
    },

    #[error("no request outstanding")]
    NoPendingRequest,

    #[error("no response available")]
    NoResponse,

    #[error("no request available")]
    NoRequest,

    #[error("invalid service name: {reason}")]
    InvalidName { reason: &'static str },

    #[error("session already owns a shared buffer")]
    BufferAlreadyAllocated,

    #[error("session has no shared buffer")]
    NoBuffer,

    #[error("peer rejected configuration (status {status:#x})")]
    ConfigRejected { status: u32 },

    #[error("timed out waiting for peer")]
    TimedOut,

    #[error("session torn down by peer")]
    PipeBroken,

    #[error("wait interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to spawn notification worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

pub type Result<T> = core::result::Result<T, SessionError>;
