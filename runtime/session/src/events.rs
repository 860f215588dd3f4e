//! Per-session pending events

use bitflags::bitflags;

bitflags! {
    /// Events a session can be waiting for, OR-accumulated until consumed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PendingEvents: u32 {
        /// Application signal bits are waiting in the S->NS signal word
        const SIGNAL = 1 << 0;
        /// A request from the peer is waiting to be fetched
        const REQUEST = 1 << 1;
        /// A response to our request is waiting to be fetched
        const RESPONSE = 1 << 2;
    }
}
