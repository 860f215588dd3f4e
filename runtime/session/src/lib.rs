//! REE Session - host side of the shared-memory session protocol
//!
//! # Purpose
//! Runs the non-secure half of the protocol on top of `ree-ipc`: the
//! startup handshake, the interrupt entry point, the notification drain
//! and the per-session state machines, exposed as blocking, polling and
//! non-blocking calls on [`Session`] handles.
//!
//! # Integration Points
//! - Depends on: `ree-ipc` for the region, rings and notification words
//! - Provides to: whatever exposes sessions to applications (device node,
//!   IPC service, tests)
//! - Peer: reached through a [`ree_ipc::Doorbell`]; the peer's interrupt
//!   line calls [`Channel::interrupt_handler`]
//!
//! # Architecture
//! - [`Channel`]: context object owning the region, session table, block
//!   allocator and drain worker
//! - [`Session`]: handle to one slot, closed on drop
//! - [`state`]: pure transition tables, no shared memory access
//! - One drain pass at a time, either on the worker thread or inline on
//!   the interrupting thread
//!
//! # Testing Strategy
//! - Unit tests: exhaustive state table, drain and reset against a raw
//!   region
//! - Integration tests: full round trips against the `ree-mock` peer
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use ree_ipc::CountingDoorbell;
//! use ree_session::{Channel, ChannelConfig};
//!
//! let config = ChannelConfig::default();
//! let region = Arc::new(config.create_region()?);
//! let channel = Channel::new(config, region, Arc::new(CountingDoorbell::new()))?;
//! channel.start_worker()?;
//! channel.start();
//!
//! let session = channel.open()?;
//! session.configure(0x1234)?;
//! session.send_request(41)?;
//! let answer = session.wait_response(None)?;
//! assert_eq!(answer.value, 42);
//! session.close()?;
//! # Ok::<(), ree_session::SessionError>(())
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod name;
pub mod session;
pub mod state;
pub mod wait;
mod worker;

pub use channel::{Channel, ChannelStats};
pub use config::ChannelConfig;
pub use error::{Result, SessionError};
pub use events::PendingEvents;
pub use name::{ServiceName, MAX_NAME_LEN};
pub use session::{CancelOutcome, Payload, Session};
pub use state::{ClientState, GlobalState, Reaction, ServerState, SessionState};
pub use wait::WaitOutcome;
