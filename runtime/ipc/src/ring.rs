//! Message ring - SPSC circular buffer of fixed-size records
//!
//! # Architecture
//! The ring lives inside the shared region. Each side owns exactly one of
//! the two indices: the producer owns `write`, the consumer owns `read`.
//! Both indices are free-running `u32` counters; the slot for index `i` is
//! `i % RING_CAPACITY`, and the ring is full when `write - read` equals the
//! capacity.
//!
//! Access is split into a checkout / work / commit sequence so several
//! records can be batched behind one index publication:
//!
//! ```text
//! producer: checkout (Acquire read) -> produce* -> commit (Release write)
//! consumer: checkout (Acquire write) -> consume* -> commit (Release read)
//! ```
//!
//! The protocol sizes the ring so that a well-behaved peer can never fill
//! it (see the static assertion below); `RingFull` therefore only shows up
//! when the peer misbehaves.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::{assert_eq_size, const_assert};

use crate::layout::MAX_SESSIONS;
use crate::message::{Message, MESSAGE_SIZE};
use crate::{IpcError, Result};

/// Number of record slots per ring
pub const RING_CAPACITY: usize = 256;

/// Upper bound on records one session can have in flight in one direction
pub const SESSION_MAX_SIMULTANEOUS_MSG: usize = 5;

const_assert!(RING_CAPACITY.is_power_of_two());
const_assert!(RING_CAPACITY >= MAX_SESSIONS * SESSION_MAX_SIMULTANEOUS_MSG);

/// One record slot: the 24 wire bytes as three little-endian words
#[repr(C)]
#[derive(Default)]
pub struct RingSlot {
    words: [AtomicU64; 3],
}

assert_eq_size!(RingSlot, [u8; MESSAGE_SIZE]);

impl RingSlot {
    fn store(&self, msg: Message) {
        for (cell, word) in self.words.iter().zip(msg.to_words()) {
            cell.store(word, Ordering::Relaxed);
        }
    }

    fn load(&self) -> Result<Message> {
        let words = [
            self.words[0].load(Ordering::Relaxed),
            self.words[1].load(Ordering::Relaxed),
            self.words[2].load(Ordering::Relaxed),
        ];
        Message::from_words(words)
    }

    fn store_zero(&self) {
        for cell in &self.words {
            cell.store(0, Ordering::Relaxed);
        }
    }
}

/// Shared-memory message ring
#[repr(C)]
pub struct MessageRing {
    /// Producer publication index
    write: AtomicU32,
    /// Consumer release index
    read: AtomicU32,
    slots: [RingSlot; RING_CAPACITY],
}

impl Default for MessageRing {
    fn default() -> Self {
        Self {
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
            slots: core::array::from_fn(|_| RingSlot::default()),
        }
    }
}

impl MessageRing {
    /// Zero both indices and every slot
    pub fn reset(&self) {
        self.write.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        for slot in &self.slots {
            slot.store_zero();
        }
    }

    /// Start a produce batch
    pub fn producer(&self) -> RingProducer<'_> {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        RingProducer {
            ring: self,
            start: write,
            write,
            read,
        }
    }

    /// Start a consume batch, snapshotting everything published so far
    pub fn consumer(&self) -> RingConsumer<'_> {
        let read = self.read.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        RingConsumer {
            ring: self,
            read,
            write,
        }
    }

    /// Number of published, unconsumed records
    pub fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, index: u32) -> &RingSlot {
        &self.slots[index as usize % RING_CAPACITY]
    }
}

/// Producer side of one batch
///
/// Records written with [`produce`](Self::produce) stay invisible to the
/// consumer until [`commit`](Self::commit). Dropping the batch without
/// committing discards them.
pub struct RingProducer<'a> {
    ring: &'a MessageRing,
    start: u32,
    write: u32,
    read: u32,
}

impl<'a> RingProducer<'a> {
    /// Copy one record into the next free slot
    ///
    /// # Errors
    /// Returns `IpcError::RingFull` if the consumer has not released a slot
    pub fn produce(&mut self, msg: Message) -> Result<()> {
        if self.write.wrapping_sub(self.read) as usize >= RING_CAPACITY {
            return Err(IpcError::RingFull {
                capacity: RING_CAPACITY,
            });
        }

        self.ring.slot(self.write).store(msg);
        self.write = self.write.wrapping_add(1);
        Ok(())
    }

    /// Number of records produced in this batch
    pub fn produced(&self) -> usize {
        self.write.wrapping_sub(self.start) as usize
    }

    /// Publish the batch; returns how many records became visible
    pub fn commit(self) -> usize {
        self.ring.write.store(self.write, Ordering::Release);
        self.produced()
    }
}

/// Consumer side of one batch
///
/// Iterating yields every record published before the batch started, in
/// FIFO order. Records whose action code does not decode come out as
/// errors but still consume their slot.
pub struct RingConsumer<'a> {
    ring: &'a MessageRing,
    read: u32,
    write: u32,
}

impl<'a> RingConsumer<'a> {
    /// Pop one record, or `None` once the snapshot is exhausted
    pub fn consume(&mut self) -> Option<Result<Message>> {
        if self.read == self.write {
            return None;
        }

        let msg = self.ring.slot(self.read).load();
        self.read = self.read.wrapping_add(1);
        Some(msg)
    }

    /// Records left in this snapshot
    pub fn remaining(&self) -> usize {
        self.write.wrapping_sub(self.read) as usize
    }

    /// Hand consumed slots back to the producer
    pub fn commit(self) {
        self.ring.read.store(self.read, Ordering::Release);
    }
}

impl<'a> Iterator for RingConsumer<'a> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        self.consume()
    }
}
