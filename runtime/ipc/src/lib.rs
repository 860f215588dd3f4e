//! REE Shared Memory IPC - transport layer of the session protocol
//!
//! # Purpose
//! Provides the pieces of the REE protocol that live directly in the memory
//! region shared between the non-secure host ("NS") and the secure
//! co-processor ("S"): the fixed 24-byte message record, the region layout,
//! the two single-producer/single-consumer message rings, the notification
//! registers and the block sub-allocator for session buffers.
//!
//! # Integration Points
//! - Depends on: nothing but the shared region itself
//! - Provides to: `ree-session` (host side), `ree-mock` (simulated secure side)
//! - Doorbells: abstracted behind the [`Doorbell`] trait
//!
//! # Architecture
//! Every field the peer can observe is an atomic. Indices and notification
//! words published by one side are stored with `Release` and read by the
//! other with `Acquire`; message payload words are plain `Relaxed` stores
//! ordered by the index publication. Nothing in this crate blocks.
//!
//! # Testing Strategy
//! - Unit tests: record codec, ring FIFO order, notification coalescing,
//!   allocator overlap/conservation
//! - Benchmarks: ring produce/consume throughput (criterion)

use thiserror::Error;

pub mod doorbell;
pub mod layout;
pub mod message;
pub mod notify;
pub mod ring;
pub mod shm;

pub use doorbell::{CountingDoorbell, Doorbell};
pub use layout::{
    ControlBlock, RegionHeader, SharedRegion, MAGIC_1, MAGIC_2, MAX_REGION_PAGES, MAX_SESSIONS,
    PAGE_SIZE, PROTOCOL_VERSION, RESERVED_PAGES,
};
pub use message::{Action, Message, CONFIG_BY_NAME, MESSAGE_SIZE};
pub use notify::{session_bit, NotificationRegister, NotifyBits};
pub use ring::{
    MessageRing, RingConsumer, RingProducer, RING_CAPACITY, SESSION_MAX_SIMULTANEOUS_MSG,
};
pub use shm::{BlockAllocator, ShmBlock};

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Ring buffer is full
    #[error("message ring full (capacity {capacity})")]
    RingFull { capacity: usize },

    /// Record carries an action code this side does not know
    #[error("unknown action code {code:#x}")]
    UnknownAction { code: u8 },

    /// Session index outside the session table
    #[error("session index {index} out of range")]
    BadSessionIndex { index: usize },

    /// Region too small to hold the control block plus one data page
    #[error("shared region of {pages} pages is too small (need > {reserved})")]
    RegionTooSmall { pages: usize, reserved: usize },

    /// Region has more pages than a block descriptor can address
    #[error("shared region of {pages} pages is too large (at most {max})")]
    RegionTooLarge { pages: usize, max: usize },

    /// Block allocator has no run of free pages large enough
    #[error("out of shared memory (requested {requested} pages)")]
    OutOfPages { requested: usize },

    /// Zero-sized block request
    #[error("invalid block size")]
    InvalidSize,

    /// Block handle does not match an allocated block
    #[error("block at offset {offset:#x} is not allocated")]
    UnknownBlock { offset: usize },

    /// Access outside of a block's bounds
    #[error("access of {len} bytes at {offset:#x} exceeds block of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
}

pub type Result<T> = core::result::Result<T, IpcError>;
