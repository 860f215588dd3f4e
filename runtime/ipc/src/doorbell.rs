//! Doorbell - cross-domain interrupt trigger
//!
//! Ringing the doorbell is the only way one side gets the other's attention.
//! On real hardware it is a secure monitor call or an SGI; here it is a trait
//! so the host can be wired to a simulated peer, a test double, or the
//! platform trap.

use core::sync::atomic::{AtomicU64, Ordering};

/// Raise an interrupt on the other side of the channel
///
/// Implementations must not block: the host calls `ring` with session
/// locks held.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
}

impl<F> Doorbell for F
where
    F: Fn() + Send + Sync,
{
    fn ring(&self) {
        self()
    }
}

/// Doorbell that only counts how often it was rung
#[derive(Debug, Default)]
pub struct CountingDoorbell {
    rings: AtomicU64,
}

impl CountingDoorbell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.rings.load(Ordering::Acquire)
    }
}

impl Doorbell for CountingDoorbell {
    fn ring(&self) {
        self.rings.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counting_doorbell() {
        let bell = CountingDoorbell::new();
        bell.ring();
        bell.ring();
        assert_eq!(bell.count(), 2);
    }

    #[test]
    fn test_closure_doorbell() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let bell: Box<dyn Doorbell> = Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        bell.ring();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
