//! Session handles
//!
//! A [`Session`] is one logical channel to a secure-world service. The
//! handle owns a slot of the channel's session table until it is closed or
//! dropped. Every operation takes the slot lock for its critical section
//! and releases it before sleeping, so the drain worker can always deliver
//! the message a waiter is waiting for.

use core::sync::atomic::{AtomicU32, Ordering};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use ree_ipc::{session_bit, Action, BlockAllocator, Message, ShmBlock, CONFIG_BY_NAME};

use crate::channel::Channel;
use crate::error::{Result, SessionError};
use crate::events::PendingEvents;
use crate::name::{ServiceName, MAX_NAME_LEN};
use crate::state::{ClientState, GlobalState, Reaction, ServerState, SessionState};
use crate::wait::{self, WaitOutcome};

/// Bytes reserved at the end of a session block for a service name
const NAME_SLOT: usize = MAX_NAME_LEN + 1;

/// Request or response payload: a 64-bit value plus a 32-bit auxiliary word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Payload {
    pub value: u64,
    pub aux: u32,
}

impl Payload {
    pub fn new(value: u64, aux: u32) -> Self {
        Self { value, aux }
    }
}

impl From<u64> for Payload {
    fn from(value: u64) -> Self {
        Self { value, aux: 0 }
    }
}

/// Result of [`Session::cancel_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Peer acknowledged the cancel; no response will follow
    Cancelled,
    /// The response crossed the cancel and is returned anyway
    Response(Payload),
}

/// Per-slot session data, guarded by the slot mutex
#[derive(Debug, Default)]
pub(crate) struct SlotInner {
    pub(crate) generation: u64,
    pub(crate) state: SessionState,
    request: Option<Payload>,
    response: Option<Payload>,
    config_status: Option<u32>,
    broken: bool,
    interrupted: bool,
    block: Option<ShmBlock>,
}

impl SlotInner {
    /// Back to a fresh slot; the generation survives
    fn clear(&mut self) {
        *self = SlotInner {
            generation: self.generation,
            ..SlotInner::default()
        };
    }
}

/// One entry of the session table
pub(crate) struct Slot {
    index: usize,
    inner: Mutex<SlotInner>,
    wake: Condvar,
}

impl Slot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(SlotInner::default()),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock()
    }

    /// Wake every thread waiting on this slot
    pub(crate) fn wake_all(&self) {
        let _inner = self.lock();
        self.wake.notify_all();
    }

    /// Prepare the slot for a new owner; returns its generation
    pub(crate) fn open(&self) -> u64 {
        let mut inner = self.lock();
        inner.clear();
        inner.generation
    }

    /// Apply a message from the peer and wake waiters if anything changed
    pub(crate) fn deliver(&self, msg: &Message, allocator: &BlockAllocator) -> Reaction {
        let mut inner = self.lock();
        let before = inner.state;
        let reaction = inner.state.receive(msg.action, msg.p1);
        let payload = Payload::new(msg.p0, msg.p1);

        match reaction {
            Reaction::Drop => return reaction,
            Reaction::ConfigAcked { status } => inner.config_status = Some(status),
            Reaction::RequestArrived => inner.request = Some(payload),
            Reaction::RequestCancelled => inner.request = None,
            Reaction::ResponseArrived => inner.response = Some(payload),
            Reaction::PeerTerminated => {
                inner.broken = true;
                inner.request = None;
                inner.response = None;
                if let Some(block) = inner.block.take() {
                    if let Err(err) = allocator.free(block) {
                        log::warn!("session {}: releasing buffer: {err}", self.index);
                    }
                }
                log::info!("session {}: terminated by peer", self.index);
            }
            Reaction::CancelAcked | Reaction::TermAcked | Reaction::TermCrossed => {}
        }

        log::debug!(
            "session {}: {:?} {:?} -> {:?}",
            self.index,
            msg.action,
            before,
            inner.state
        );
        self.wake.notify_all();
        reaction
    }

    /// Channel reset: forget everything and fail current and future waiters
    ///
    /// The block is dropped without freeing; the allocator is reset as a whole.
    pub(crate) fn break_link(&self) {
        let mut inner = self.lock();
        inner.clear();
        inner.broken = true;
        self.wake.notify_all();
    }
}

/// Handle to an open session
///
/// Dropping the handle closes the session. Call [`close`](Self::close) to
/// observe the result.
pub struct Session {
    channel: Arc<Channel>,
    index: usize,
    generation: u64,
    closed: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(channel: Arc<Channel>, index: usize, generation: u64) -> Self {
        Self {
            channel,
            index,
            generation,
            closed: false,
        }
    }

    /// Slot index, also the `index` field of every message of this session
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current state variables
    pub fn state(&self) -> Result<SessionState> {
        Ok(self.lock()?.state)
    }

    fn slot(&self) -> &Slot {
        self.channel.slot(self.index)
    }

    fn wire_index(&self) -> u8 {
        self.index as u8
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotInner>> {
        let inner = self.slot().lock();
        if inner.generation != self.generation {
            return Err(SessionError::InvalidSession);
        }
        Ok(inner)
    }

    /// Lock and reject sessions that can no longer talk to the peer
    fn lock_live(&self) -> Result<MutexGuard<'_, SlotInner>> {
        let inner = self.lock()?;
        if inner.broken {
            return Err(SessionError::PipeBroken);
        }
        if self.channel.is_shut_down() {
            return Err(SessionError::ShutDown);
        }
        Ok(inner)
    }

    /// Sleep until `ready` holds, the link breaks, or the wait is cut short
    fn wait<'a, F>(
        &'a self,
        mut inner: MutexGuard<'a, SlotInner>,
        timeout: Option<Duration>,
        mut ready: F,
    ) -> Result<MutexGuard<'a, SlotInner>>
    where
        F: FnMut(&SlotInner) -> bool,
    {
        let channel = &self.channel;
        let outcome = wait::wait_until(&self.slot().wake, &mut inner, timeout, |inner| {
            if inner.broken || channel.is_shut_down() || ready(inner) {
                Some(WaitOutcome::Ready)
            } else if std::mem::take(&mut inner.interrupted) {
                Some(WaitOutcome::Interrupted)
            } else {
                None
            }
        });

        match outcome {
            WaitOutcome::Ready if inner.broken => Err(SessionError::PipeBroken),
            WaitOutcome::Ready if channel.is_shut_down() => Err(SessionError::ShutDown),
            WaitOutcome::Ready => Ok(inner),
            WaitOutcome::TimedOut => Err(SessionError::TimedOut),
            WaitOutcome::Interrupted => Err(SessionError::Interrupted),
        }
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.channel.post(&[msg])
    }

    fn inbound_signal(&self) -> Result<&AtomicU32> {
        Ok(self.channel.region().control().signal_s_to_ns(self.index)?)
    }

    fn pending_events(inner: &SlotInner, signal: &AtomicU32) -> PendingEvents {
        let mut events = PendingEvents::empty();
        if signal.load(Ordering::Acquire) != 0 {
            events |= PendingEvents::SIGNAL;
        }
        if inner.state.is_configured() {
            if inner.state.server == ServerState::Notified {
                events |= PendingEvents::REQUEST;
            }
            if inner.state.client == ClientState::Notified {
                events |= PendingEvents::RESPONSE;
            }
        }
        events
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Bind the session to the service with id `service_id`
    ///
    /// Blocks until the peer acknowledges or the configured timeout passes.
    /// After `TimedOut` the session stays in CONFIG_WAITING and calling
    /// `configure` again resumes the wait without resending CONFIG.
    ///
    /// # Errors
    /// - `SessionError::ConfigRejected` with the peer's status code
    /// - `SessionError::AlreadyConfigured` if the session is past CONFIG
    /// - `SessionError::TimedOut`, `Interrupted`, `PipeBroken`
    pub fn configure(&self, service_id: u64) -> Result<()> {
        let index = self.wire_index();
        self.configure_with(|_, inner| {
            let descriptor = inner.block.map_or(0, |block| block.descriptor());
            Ok(Message::new(index, Action::Config).with_payload(service_id, descriptor))
        })
    }

    /// Bind the session to a service by name
    ///
    /// The NUL-terminated name is written at the end of the session block,
    /// which is allocated (one page) if the session has none yet.
    pub fn configure_by_name(&self, name: &str) -> Result<()> {
        let name = ServiceName::new(name)?;
        let index = self.wire_index();

        self.configure_with(|channel, inner| {
            let block = match inner.block {
                Some(block) => block,
                None => {
                    let block = channel.allocator().alloc(1)?;
                    inner.block = Some(block);
                    block
                }
            };

            let offset = block.size() - NAME_SLOT;
            channel
                .region()
                .write_bytes(block.offset() + offset, &name.to_bytes_with_nul())?;
            log::debug!("session {index}: configuring by name {:?}", name.as_str());

            Ok(Message::new(index, Action::Config)
                .with_payload(offset as u64, block.descriptor())
                .with_flags(CONFIG_BY_NAME))
        })
    }

    fn configure_with<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&Channel, &mut SlotInner) -> Result<Message>,
    {
        let mut inner = self.lock_live()?;

        match inner.state.global {
            GlobalState::Null => {
                // A late rejection of an earlier attempt says nothing about this one
                inner.config_status = None;
                let mut next = inner.state;
                next.begin_config()?;
                let msg = build(&*self.channel, &mut *inner)?;
                self.send(msg)?;
                inner.state = next;
            }
            GlobalState::ConfigWaiting => {
                log::debug!("session {}: resuming configure", self.index);
            }
            // The ack of a timed-out attempt landed since
            GlobalState::Configured if inner.config_status.is_some() => {}
            _ => return Err(SessionError::AlreadyConfigured),
        }

        let timeout = self.channel.config().config_timeout();
        let mut inner = self.wait(inner, timeout, |inner| inner.config_status.is_some())?;

        match inner.config_status.take() {
            Some(0) => Ok(()),
            Some(status) => {
                log::info!("session {}: configuration rejected ({status:#x})", self.index);
                Err(SessionError::ConfigRejected { status })
            }
            None => Err(SessionError::NotConfigured),
        }
    }

    // ------------------------------------------------------------------
    // Client side
    // ------------------------------------------------------------------

    /// Submit a request without waiting for the response
    ///
    /// # Errors
    /// `SessionError::ProtocolViolation` while a previous request is still
    /// outstanding or its response has not been fetched
    pub fn send_request(&self, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        let mut inner = self.lock_live()?;

        let mut next = inner.state;
        next.begin_request()?;
        let msg = Message::new(self.wire_index(), Action::Request);
        self.send(msg.with_payload(payload.value, payload.aux))?;
        inner.state = next;
        inner.response = None;
        Ok(())
    }

    /// Fetch the response if it has arrived
    ///
    /// # Errors
    /// `SessionError::NoResponse` if there is nothing to fetch
    pub fn get_response(&self) -> Result<Payload> {
        let mut inner = self.lock_live()?;
        Self::take_response(&mut inner)
    }

    /// Block until the response to the outstanding request arrives
    ///
    /// # Errors
    /// `SessionError::NoPendingRequest` if no request is outstanding, or if
    /// a concurrent `cancel_request` withdraws it during the wait
    pub fn wait_response(&self, timeout: Option<Duration>) -> Result<Payload> {
        let inner = self.lock_live()?;
        inner.state.require_configured()?;
        if inner.state.client == ClientState::Idle {
            return Err(SessionError::NoPendingRequest);
        }

        let mut inner = self.wait(inner, timeout, |inner| {
            matches!(inner.state.client, ClientState::Notified | ClientState::Idle)
        })?;
        if inner.state.client == ClientState::Idle {
            return Err(SessionError::NoPendingRequest);
        }
        Self::take_response(&mut inner)
    }

    fn take_response(inner: &mut SlotInner) -> Result<Payload> {
        inner.state.take_response()?;
        inner.response.take().ok_or(SessionError::NoResponse)
    }

    /// Withdraw the outstanding request
    ///
    /// The peer may have answered before it saw the cancel; that response
    /// is returned instead of being lost. After `TimedOut` the cancel is
    /// still in flight and calling again resumes the wait.
    pub fn cancel_request(&self, timeout: Option<Duration>) -> Result<CancelOutcome> {
        let mut inner = self.lock_live()?;
        inner.state.require_configured()?;

        match inner.state.client {
            ClientState::Notified => {
                return Self::take_response(&mut inner).map(CancelOutcome::Response);
            }
            ClientState::CancelWaiting => {}
            _ => {
                let mut next = inner.state;
                next.begin_cancel()?;
                self.send(Message::new(self.wire_index(), Action::Cancel))?;
                inner.state = next;
            }
        }

        let mut inner = self.wait(inner, timeout, |inner| {
            matches!(inner.state.client, ClientState::Idle | ClientState::Notified)
        })?;

        if inner.state.client == ClientState::Notified {
            Self::take_response(&mut inner).map(CancelOutcome::Response)
        } else {
            Ok(CancelOutcome::Cancelled)
        }
    }

    // ------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------

    /// Fetch a request from the peer if one has arrived
    pub fn get_request(&self) -> Result<Payload> {
        let mut inner = self.lock_live()?;
        Self::take_request(&mut inner)
    }

    /// Block until the peer sends a request
    pub fn wait_request(&self, timeout: Option<Duration>) -> Result<Payload> {
        let inner = self.lock_live()?;
        inner.state.require_configured()?;
        if inner.state.server == ServerState::Busy {
            return Err(inner.state.violation("wait_request"));
        }

        let mut inner = self.wait(inner, timeout, |inner| {
            inner.state.server == ServerState::Notified
        })?;
        Self::take_request(&mut inner)
    }

    fn take_request(inner: &mut SlotInner) -> Result<Payload> {
        inner.state.take_request()?;
        inner.request.take().ok_or(SessionError::NoRequest)
    }

    /// Answer the request fetched with `get_request`/`wait_request`
    pub fn send_response(&self, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        let mut inner = self.lock_live()?;

        let mut next = inner.state;
        next.begin_response()?;
        let msg = Message::new(self.wire_index(), Action::Response);
        self.send(msg.with_payload(payload.value, payload.aux))?;
        inner.state = next;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signals and events
    // ------------------------------------------------------------------

    /// OR `bits` into the peer's signal word for this session
    ///
    /// The peer is only notified when its word was empty; bits raised
    /// before it drains are delivered together.
    pub fn send_signal(&self, bits: u32) -> Result<()> {
        let inner = self.lock_live()?;
        inner.state.require_configured()?;
        if bits == 0 {
            return Ok(());
        }

        let word = self.channel.region().control().signal_ns_to_s(self.index)?;
        if word.fetch_or(bits, Ordering::AcqRel) == 0 {
            self.channel.notify_peer(session_bit(self.index));
        }
        Ok(())
    }

    /// Take and clear the signal bits raised by the peer; 0 if none
    pub fn get_signal(&self) -> Result<u32> {
        let word = self.inbound_signal()?;
        let _inner = self.lock_live()?;
        Ok(word.swap(0, Ordering::AcqRel))
    }

    /// Block until the peer raises a signal, then take the bits
    pub fn wait_signal(&self, timeout: Option<Duration>) -> Result<u32> {
        let word = self.inbound_signal()?;
        let inner = self.lock_live()?;
        let _inner = self.wait(inner, timeout, |_| word.load(Ordering::Acquire) != 0)?;
        Ok(word.swap(0, Ordering::AcqRel))
    }

    /// Block until any event in `mask` is pending
    ///
    /// Returns the pending events restricted to `mask`. Nothing is
    /// consumed; fetch with the matching `get_*` call.
    pub fn wait_event(
        &self,
        mask: PendingEvents,
        timeout: Option<Duration>,
    ) -> Result<PendingEvents> {
        let word = self.inbound_signal()?;
        let inner = self.lock_live()?;
        if mask.is_empty() {
            return Ok(PendingEvents::empty());
        }

        let inner = self.wait(inner, timeout, |inner| {
            Self::pending_events(inner, word).intersects(mask)
        })?;
        Ok(Self::pending_events(&inner, word) & mask)
    }

    /// Pending events, without blocking or consuming anything
    pub fn poll_events(&self) -> Result<PendingEvents> {
        let word = self.inbound_signal()?;
        let inner = self.lock_live()?;
        Ok(Self::pending_events(&inner, word))
    }

    /// Readiness check for a multiplexed wait loop
    ///
    /// An errored session counts as ready so the poller wakes up and sees
    /// the error on its next call.
    pub fn is_ready(&self, mask: PendingEvents) -> bool {
        match self.poll_events() {
            Ok(events) => events.intersects(mask),
            Err(_) => true,
        }
    }

    /// Wake a thread blocked in any wait on this session with `Interrupted`
    ///
    /// If no thread is waiting, the next wait returns `Interrupted` at once.
    pub fn interrupt(&self) {
        let slot = self.slot();
        let mut inner = slot.lock();
        if inner.generation == self.generation {
            inner.interrupted = true;
            slot.wake.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // Shared buffer
    // ------------------------------------------------------------------

    /// Allocate the session's shared buffer; must precede configuration
    pub fn alloc_buffer(&self, nr_pages: usize) -> Result<ShmBlock> {
        let mut inner = self.lock_live()?;
        if inner.block.is_some() {
            return Err(SessionError::BufferAlreadyAllocated);
        }
        if inner.state.global != GlobalState::Null {
            return Err(SessionError::AlreadyConfigured);
        }

        let block = self.channel.allocator().alloc(nr_pages)?;
        inner.block = Some(block);
        Ok(block)
    }

    pub fn buffer(&self) -> Result<ShmBlock> {
        self.lock_live()?.block.ok_or(SessionError::NoBuffer)
    }

    /// Copy `bytes` into the shared buffer at `offset`
    pub fn write_buffer(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let inner = self.lock_live()?;
        let block = inner.block.ok_or(SessionError::NoBuffer)?;
        block.check_range(offset, bytes.len())?;
        self.channel.region().write_bytes(block.offset() + offset, bytes)?;
        Ok(())
    }

    /// Copy from the shared buffer at `offset` into `buf`
    pub fn read_buffer(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.lock_live()?;
        let block = inner.block.ok_or(SessionError::NoBuffer)?;
        block.check_range(offset, buf.len())?;
        self.channel.region().read_bytes(block.offset() + offset, buf)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Terminate the session and release its slot
    ///
    /// A configured session sends TERM and waits a bounded time for
    /// TERM_ACK. The slot and buffer are released whether or not the ack
    /// arrives.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.closed = true;
        let channel = Arc::clone(&self.channel);
        let slot = channel.slot(self.index);

        let mut inner = slot.lock();
        if inner.generation != self.generation {
            return Err(SessionError::InvalidSession);
        }

        let mut result = Ok(());
        let mut next = inner.state;
        if !inner.broken && !channel.is_shut_down() && next.begin_term() {
            match channel.post(&[Message::new(self.wire_index(), Action::Term)]) {
                Ok(()) => {
                    inner.state = next;
                    let timeout = channel.config().close_timeout();
                    let outcome = wait::wait_until(&slot.wake, &mut inner, Some(timeout), |inner| {
                        (inner.state.global == GlobalState::Null || inner.broken)
                            .then_some(WaitOutcome::Ready)
                    });
                    if outcome == WaitOutcome::TimedOut {
                        log::warn!(
                            "session {}: no TERM_ACK within {:?}, closing anyway",
                            self.index,
                            timeout
                        );
                    }
                }
                Err(err) => result = Err(err),
            }
        }

        if let Some(block) = inner.block.take() {
            if let Err(err) = channel.allocator().free(block) {
                log::warn!("session {}: releasing buffer: {err}", self.index);
            }
        }
        inner.clear();
        inner.generation = inner.generation.wrapping_add(1);
        drop(inner);

        channel.release_slot(self.index);
        log::debug!("session {}: closed", self.index);
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.release() {
                log::warn!("session {}: close on drop failed: {err}", self.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ree_ipc::PAGE_SIZE;

    #[test]
    fn test_slot_open_keeps_generation() {
        let slot = Slot::new(0);
        slot.lock().generation = 7;
        slot.lock().broken = true;
        assert_eq!(slot.open(), 7);
        assert!(!slot.lock().broken);
    }

    #[test]
    fn test_deliver_drop_leaves_slot_untouched() {
        let slot = Slot::new(3);
        let alloc = BlockAllocator::new(4, 4);
        let msg = Message::new(3, Action::Response).with_payload(1, 2);

        assert_eq!(slot.deliver(&msg, &alloc), Reaction::Drop);
        assert!(slot.lock().response.is_none());
    }

    #[test]
    fn test_peer_term_frees_block() {
        let slot = Slot::new(0);
        let alloc = BlockAllocator::new(4, 4);
        {
            let mut inner = slot.lock();
            inner.state.begin_config().unwrap();
            inner.state.receive(Action::ConfigAck, 0);
            inner.block = Some(alloc.alloc(2).unwrap());
        }

        let reaction = slot.deliver(&Message::new(0, Action::Term), &alloc);
        assert_eq!(reaction, Reaction::PeerTerminated);
        assert_eq!(reaction.reply(), Some(Action::TermAck));

        let inner = slot.lock();
        assert!(inner.broken);
        assert!(inner.block.is_none());
        assert_eq!(alloc.free_pages(), 4);
    }

    #[test]
    fn test_pending_events_follow_state() {
        let word = AtomicU32::new(0);
        let mut inner = SlotInner::default();
        assert!(Session::pending_events(&inner, &word).is_empty());

        inner.state.begin_config().unwrap();
        inner.state.receive(Action::ConfigAck, 0);
        inner.state.receive(Action::Request, 0);
        word.store(0x10, Ordering::Relaxed);

        let events = Session::pending_events(&inner, &word);
        assert_eq!(events, PendingEvents::REQUEST | PendingEvents::SIGNAL);
    }

    #[test]
    fn test_name_slot_fits_a_page() {
        assert!(NAME_SLOT < PAGE_SIZE);
    }
}
