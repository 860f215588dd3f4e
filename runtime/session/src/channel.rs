//! Channel context
//!
//! A [`Channel`] owns everything the host side of the protocol needs: the
//! shared region, the doorbell into the peer, the session table, the block
//! allocator and the drain worker. It is created once, shared behind an
//! `Arc`, and every session handle keeps it alive.
//!
//! # Locks
//! Acquired in this order, never the reverse:
//! `drain_lock` -> `table` -> slot -> `ring_lock`. `link` and `worker` are
//! leaf locks. No lock is held while sleeping except through a condvar.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use ree_ipc::{
    BlockAllocator, Doorbell, Message, NotifyBits, SharedRegion, MAGIC_2, MAX_SESSIONS,
};

use crate::config::ChannelConfig;
use crate::error::{Result, SessionError};
use crate::session::{Session, Slot};
use crate::state::Reaction;
use crate::wait::{self, WaitOutcome};
use crate::worker::DrainWorker;

/// Handshake state
#[derive(Debug, Default)]
struct Link {
    ready: bool,
    peer_version: u32,
}

#[derive(Debug, Default)]
struct Stats {
    dropped_messages: AtomicU64,
    doorbells: AtomicU64,
    resets: AtomicU64,
    handshakes: AtomicU64,
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Inbound records dropped as corrupt, misaddressed or unexpected
    pub dropped_messages: u64,
    /// Doorbells rung into the peer
    pub doorbells: u64,
    /// Peer-requested channel resets handled
    pub resets: u64,
    /// Completed handshakes
    pub handshakes: u64,
}

/// Host side of one shared-memory channel
pub struct Channel {
    config: ChannelConfig,
    region: Arc<SharedRegion>,
    doorbell: Arc<dyn Doorbell>,
    allocator: BlockAllocator,
    slots: Vec<Slot>,
    table: Mutex<[bool; MAX_SESSIONS]>,
    ring_lock: Mutex<()>,
    drain_lock: Mutex<()>,
    link: Mutex<Link>,
    link_changed: Condvar,
    shut_down: AtomicBool,
    worker: Mutex<Option<DrainWorker>>,
    stats: Stats,
}

impl Channel {
    /// Create a channel over `region`, ringing the peer through `doorbell`
    ///
    /// Nothing is written to the region until [`start`](Self::start).
    ///
    /// # Errors
    /// `SessionError::Config` if the region size disagrees with the config
    pub fn new(
        config: ChannelConfig,
        region: Arc<SharedRegion>,
        doorbell: Arc<dyn Doorbell>,
    ) -> Result<Arc<Self>> {
        if region.total_pages() != config.shm_pages {
            return Err(SessionError::Config(format!(
                "region has {} pages, configuration expects {}",
                region.total_pages(),
                config.shm_pages
            )));
        }

        Ok(Arc::new(Self {
            allocator: BlockAllocator::for_region(&region),
            slots: (0..MAX_SESSIONS).map(Slot::new).collect(),
            table: Mutex::new([false; MAX_SESSIONS]),
            ring_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            link: Mutex::new(Link::default()),
            link_changed: Condvar::new(),
            shut_down: AtomicBool::new(false),
            worker: Mutex::new(None),
            stats: Stats::default(),
            config,
            region,
            doorbell,
        }))
    }

    /// Closure suitable as the peer's interrupt line into this channel
    ///
    /// Holds only a weak reference; interrupts after the channel is gone
    /// are ignored.
    pub fn interrupt_handler(self: &Arc<Self>) -> impl Fn() + Send + Sync + 'static {
        let channel = Arc::downgrade(self);
        move || {
            if let Some(channel) = channel.upgrade() {
                channel.handle_interrupt();
            }
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    pub(crate) fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    pub fn is_ready(&self) -> bool {
        self.link.lock().ready
    }

    /// Version the peer reported in the last handshake
    pub fn peer_version(&self) -> Option<u32> {
        let link = self.link.lock();
        link.ready.then_some(link.peer_version)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            dropped_messages: self.stats.dropped_messages.load(Ordering::Relaxed),
            doorbells: self.stats.doorbells.load(Ordering::Relaxed),
            resets: self.stats.resets.load(Ordering::Relaxed),
            handshakes: self.stats.handshakes.load(Ordering::Relaxed),
        }
    }

    /// Number of session slots currently owned by a handle
    pub fn sessions_in_use(&self) -> usize {
        self.table.lock().iter().filter(|used| **used).count()
    }

    // ------------------------------------------------------------------
    // Startup and handshake
    // ------------------------------------------------------------------

    /// Initialise the region and ring the peer to start the handshake
    pub fn start(&self) {
        *self.link.lock() = Link::default();
        self.initialize_region();
        log::info!(
            "ree: region initialised ({} pages, {} reserved), waiting for peer",
            self.region.total_pages(),
            self.region.reserved_pages()
        );
        self.ring_doorbell();
    }

    fn initialize_region(&self) {
        let _ring = self.ring_lock.lock();
        self.region.initialize(self.config.protocol_version);
    }

    /// Run notification processing on a dedicated thread from now on
    ///
    /// Without a worker, [`handle_interrupt`](Self::handle_interrupt) drains
    /// inline on the interrupting thread.
    pub fn start_worker(self: &Arc<Self>) -> Result<()> {
        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }

        let mut worker = self.worker.lock();
        if worker.is_none() {
            let spawned = DrainWorker::spawn(Arc::downgrade(self))?;
            // Catch up on anything raised before the worker existed
            spawned.schedule();
            *worker = Some(spawned);
        }
        Ok(())
    }

    /// Entry point for the peer's doorbell
    ///
    /// Until the handshake completes, an interrupt can only mean the peer
    /// has synchronised. Afterwards it schedules a drain pass.
    pub fn handle_interrupt(&self) {
        if self.is_shut_down() {
            return;
        }
        if !self.synchronize() {
            log::debug!("ree: interrupt before peer handshake, ignored");
            return;
        }
        self.schedule_drain();
    }

    /// Mark the link ready if the peer has published `MAGIC_2`
    fn synchronize(&self) -> bool {
        let mut link = self.link.lock();
        if link.ready {
            return true;
        }

        let header = &self.region.control().header;
        if header.magic() != MAGIC_2 {
            return false;
        }

        link.ready = true;
        link.peer_version = header.version();
        self.stats.handshakes.fetch_add(1, Ordering::Relaxed);
        self.link_changed.notify_all();

        if link.peer_version >> 16 != self.config.protocol_version >> 16 {
            log::warn!(
                "ree: peer protocol version {:#x} differs from ours ({:#x})",
                link.peer_version,
                self.config.protocol_version
            );
        }
        log::info!("ree: peer synchronised, version {:#x}", link.peer_version);
        true
    }

    fn schedule_drain(&self) {
        let queued = self.worker.lock().as_ref().map(DrainWorker::schedule);
        if queued.is_none() {
            self.process_notifications();
        }
    }

    fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let mut link = self.link.lock();
        let outcome = wait::wait_until(&self.link_changed, &mut link, timeout, |link| {
            (link.ready || self.is_shut_down()).then_some(WaitOutcome::Ready)
        });
        drop(link);

        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        match outcome {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut | WaitOutcome::Interrupted => Err(SessionError::TimedOut),
        }
    }

    // ------------------------------------------------------------------
    // Notification drain
    // ------------------------------------------------------------------

    /// One pass of the drain work item
    ///
    /// Takes the whole inbound notification word. RESET preempts everything
    /// else. Signal bits wake their sessions; MESSAGE drains the inbound
    /// ring until it stays empty, then posts any replies as one batch.
    pub fn process_notifications(&self) {
        let _drain = self.drain_lock.lock();
        let control = self.region.control();

        let pending = control.notif_s_to_ns().take();
        if pending.is_empty() {
            return;
        }

        if pending.contains(NotifyBits::RESET) {
            self.handle_reset();
            return;
        }

        for index in pending.sessions() {
            self.slots[index].wake_all();
        }

        if !pending.contains(NotifyBits::MESSAGE) {
            return;
        }

        let mut replies = Vec::new();
        loop {
            let mut consumer = control.ring_s_to_ns.consumer();
            if consumer.remaining() == 0 {
                break;
            }
            for record in consumer.by_ref() {
                match record {
                    Ok(msg) => self.dispatch(&msg, &mut replies),
                    Err(err) => self.drop_message(format_args!("corrupt record: {err}")),
                }
            }
            consumer.commit();
        }

        if let Err(err) = self.post(&replies) {
            log::error!("ree: failed to post {} replies: {err}", replies.len());
        }
    }

    fn dispatch(&self, msg: &Message, replies: &mut Vec<Message>) {
        let Some(slot) = self.slots.get(usize::from(msg.index)) else {
            self.drop_message(format_args!("{msg:?} for session out of range"));
            return;
        };

        let reaction = slot.deliver(msg, &self.allocator);
        if reaction == Reaction::Drop {
            self.drop_message(format_args!(
                "{:?} unexpected for session {}",
                msg.action, msg.index
            ));
        }
        if let Some(action) = reaction.reply() {
            replies.push(Message::new(msg.index, action));
        }
    }

    fn drop_message(&self, why: core::fmt::Arguments<'_>) {
        self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
        log::debug!("ree: dropped {why}");
    }

    /// Peer announced a geometry change: break every session and start over
    fn handle_reset(&self) {
        log::warn!("ree: peer requested channel reset");

        *self.link.lock() = Link::default();
        {
            // Held across the allocator reset so no new session can take a block first
            let table = self.table.lock();
            for (slot, _) in self.slots.iter().zip(table.iter()).filter(|(_, used)| **used) {
                slot.break_link();
            }
            self.allocator.reset();
        }
        self.initialize_region();
        self.stats.resets.fetch_add(1, Ordering::Relaxed);
        self.ring_doorbell();
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Publish `msgs` as one batch and notify the peer
    ///
    /// All or nothing: if the ring cannot take every record, none is sent.
    pub(crate) fn post(&self, msgs: &[Message]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }

        {
            let _ring = self.ring_lock.lock();
            let mut producer = self.region.control().ring_ns_to_s.producer();
            for msg in msgs {
                producer.produce(*msg)?;
            }
            producer.commit();
        }

        self.notify_peer(NotifyBits::MESSAGE);
        Ok(())
    }

    /// Raise notification bits, ringing only on the empty to non-empty edge
    pub(crate) fn notify_peer(&self, bits: NotifyBits) {
        if self.region.control().notif_ns_to_s().raise(bits) {
            self.ring_doorbell();
        }
    }

    fn ring_doorbell(&self) {
        self.stats.doorbells.fetch_add(1, Ordering::Relaxed);
        self.doorbell.ring();
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Open a session, waiting for the handshake if needed
    pub fn open(self: &Arc<Self>) -> Result<Session> {
        self.open_timeout(None)
    }

    /// Open a session, waiting at most `timeout` for the handshake
    pub fn open_timeout(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Session> {
        self.wait_ready(timeout)?;
        self.claim_slot()
    }

    /// Open a session without blocking
    ///
    /// # Errors
    /// `SessionError::NotReady` before the handshake completes,
    /// `SessionError::NoFreeSession` when every slot is taken
    pub fn open_nonblocking(self: &Arc<Self>) -> Result<Session> {
        if self.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        self.claim_slot()
    }

    fn claim_slot(self: &Arc<Self>) -> Result<Session> {
        let mut table = self.table.lock();
        let index = table
            .iter()
            .position(|used| !used)
            .ok_or(SessionError::NoFreeSession)?;

        // Signal bits left over from the previous owner, in both directions
        let control = self.region.control();
        control.signal_s_to_ns(index)?.swap(0, Ordering::AcqRel);
        control.signal_ns_to_s(index)?.swap(0, Ordering::AcqRel);
        table[index] = true;
        let generation = self.slots[index].open();
        drop(table);

        log::debug!("session {index}: opened");
        Ok(Session::new(Arc::clone(self), index, generation))
    }

    pub(crate) fn release_slot(&self, index: usize) {
        if let Some(used) = self.table.lock().get_mut(index) {
            *used = false;
        }
    }

    /// Stop the worker and fail every current and future wait
    ///
    /// Open handles can still be closed; no TERM is sent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _link = self.link.lock();
            self.link_changed.notify_all();
        }
        for slot in &self.slots {
            slot.wake_all();
        }

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        log::info!("ree: channel shut down");
    }
}
