//! Notification registers - doorbell reason multiplexing
//!
//! One 32-bit word per direction carries every reason the sender rang the
//! receiver's doorbell:
//!
//! ```text
//! bit 31      RESET    channel geometry is about to change
//! bit 30      MESSAGE  new records are pending in the ring
//! bits 0..27  SIGNAL   per-session application signal pending
//! ```
//!
//! Bits are only ever set with `fetch_or` and only ever cleared by the
//! receiver with a single `swap(0)`. The sender rings the doorbell only when
//! the word was zero before its `fetch_or`: any non-zero word means the
//! receiver already has a doorbell outstanding and will see the new bit
//! when it drains.

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::layout::MAX_SESSIONS;

bitflags! {
    /// Bits of a notification register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyBits: u32 {
        /// Peer requests a full channel reset
        const RESET = 1 << 31;
        /// Records are pending in the ring
        const MESSAGE = 1 << 30;
        /// Mask covering every per-session signal bit
        const SESSIONS = (1 << MAX_SESSIONS) - 1;
    }
}

/// Notification bit for one session
pub fn session_bit(index: usize) -> NotifyBits {
    debug_assert!(index < MAX_SESSIONS);
    NotifyBits::from_bits_retain(1 << index) & NotifyBits::SESSIONS
}

impl NotifyBits {
    /// Indices of the sessions whose signal bit is set
    pub fn sessions(self) -> impl Iterator<Item = usize> {
        let bits = (self & NotifyBits::SESSIONS).bits();
        (0..MAX_SESSIONS).filter(move |i| bits & (1 << i) != 0)
    }
}

/// View of one notification word in the shared region
#[derive(Clone, Copy)]
pub struct NotificationRegister<'a> {
    word: &'a AtomicU32,
}

impl<'a> NotificationRegister<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Set bits; returns `true` when the caller must ring the doorbell
    ///
    /// Only the transition from an all-zero word asks for a doorbell, so a
    /// burst of raises before the receiver drains costs one interrupt.
    pub fn raise(&self, bits: NotifyBits) -> bool {
        let previous = self.word.fetch_or(bits.bits(), Ordering::AcqRel);
        previous == 0
    }

    /// Atomically read and clear the whole word
    pub fn take(&self) -> NotifyBits {
        NotifyBits::from_bits_retain(self.word.swap(0, Ordering::AcqRel))
    }

    /// Read without clearing
    pub fn peek(&self) -> NotifyBits {
        NotifyBits::from_bits_retain(self.word.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalescing() {
        let word = AtomicU32::new(0);
        let reg = NotificationRegister::new(&word);

        let rings = (0..10)
            .filter(|_| reg.raise(NotifyBits::MESSAGE))
            .count();
        assert_eq!(rings, 1);

        // A different reason while the word is non-zero is coalesced too
        assert!(!reg.raise(session_bit(3)));

        let taken = reg.take();
        assert_eq!(taken, NotifyBits::MESSAGE | session_bit(3));
        assert!(reg.peek().is_empty());

        // Next raise after a drain rings again
        assert!(reg.raise(session_bit(0)));
    }

    #[test]
    fn test_session_bits() {
        assert_eq!(session_bit(0).bits(), 1);
        assert_eq!(session_bit(27).bits(), 1 << 27);

        let bits = session_bit(1) | session_bit(5) | NotifyBits::RESET;
        let sessions: Vec<usize> = bits.sessions().collect();
        assert_eq!(sessions, vec![1, 5]);
    }

    #[test]
    fn test_reserved_bits_do_not_overlap_sessions() {
        assert!(!NotifyBits::SESSIONS.intersects(NotifyBits::RESET | NotifyBits::MESSAGE));
    }
}
