//! Simulated secure world for the REE session protocol
//!
//! Plays the S side of a shared region in the same process so the host
//! crate can be exercised without a co-processor. It is only meant for
//! tests and benchmarks.
//!
//! # Usage
//! ```no_run
//! use std::sync::Arc;
//! use ree_ipc::SharedRegion;
//! use ree_mock::{EchoService, MockSecureWorld};
//!
//! let region = Arc::new(SharedRegion::new(16)?);
//! let peer = MockSecureWorld::new(region.clone());
//! let doorbell = peer.doorbell(); // hand to the host channel
//! // peer.connect_host(channel.interrupt_handler());
//! peer.serve(EchoService::new())?;
//! # Ok::<(), ree_mock::MockError>(())
//! ```
//!
//! The peer interrupts the host by calling the closure given to
//! [`MockSecureWorld::connect_host`], always with its own locks released.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ree_ipc::{
    session_bit, Action, Doorbell, IpcError, Message, NotifyBits, SharedRegion, CONFIG_BY_NAME,
    MAGIC_1, MAGIC_2, MAX_SESSIONS, PAGE_SIZE, PROTOCOL_VERSION, RESERVED_PAGES,
};
use thiserror::Error;

/// How long the service thread sleeps between doorbell checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Longest name the peer will read for a by-name CONFIG
const NAME_LIMIT: usize = 32;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("region not initialised by the host (magic {magic:#x})")]
    NotInitialized { magic: u32 },

    #[error("unexpected geometry: {reserved_pages} reserved pages, {max_sessions} sessions")]
    Geometry {
        reserved_pages: u16,
        max_sessions: u16,
    },

    #[error("failed to start peer thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

pub type Result<T> = core::result::Result<T, MockError>;

type HostIrq = Arc<dyn Fn() + Send + Sync>;

/// How the simulated service answers the host
pub trait PeerBehavior {
    /// Replies to one message from the host
    fn on_message(&mut self, msg: &Message) -> Vec<Message>;

    /// Signal bits to raise back after the host signalled `index`
    fn on_signal(&mut self, index: usize, bits: u32) -> Option<u32> {
        let _ = (index, bits);
        None
    }
}

/// Default service: acks config, answers `REQUEST(x)` with `RESPONSE(x + 1)`
#[derive(Debug, Clone)]
pub struct EchoService {
    config_status: u32,
    ack_term: bool,
    hold_requests: bool,
    held: [bool; MAX_SESSIONS],
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoService {
    pub fn new() -> Self {
        Self {
            config_status: 0,
            ack_term: true,
            hold_requests: false,
            held: [false; MAX_SESSIONS],
        }
    }

    /// Answer every CONFIG with `status`
    pub fn rejecting(mut self, status: u32) -> Self {
        self.config_status = status;
        self
    }

    /// Never acknowledge TERM
    pub fn without_term_ack(mut self) -> Self {
        self.ack_term = false;
        self
    }

    /// Keep requests unanswered so they can be cancelled
    pub fn holding_requests(mut self) -> Self {
        self.hold_requests = true;
        self
    }

    fn held(&mut self, index: u8) -> Option<&mut bool> {
        self.held.get_mut(usize::from(index))
    }
}

impl PeerBehavior for EchoService {
    fn on_message(&mut self, msg: &Message) -> Vec<Message> {
        let reply = |action| Message::new(msg.index, action);

        match msg.action {
            Action::Config => vec![reply(Action::ConfigAck).with_payload(0, self.config_status)],
            Action::Request if self.hold_requests => {
                if let Some(held) = self.held(msg.index) {
                    *held = true;
                }
                Vec::new()
            }
            Action::Request => {
                vec![reply(Action::Response).with_payload(msg.p0.wrapping_add(1), msg.p1)]
            }
            Action::Cancel => match self.held(msg.index) {
                Some(held) if *held => {
                    *held = false;
                    vec![reply(Action::CancelAck)]
                }
                _ => Vec::new(),
            },
            Action::Term => {
                if let Some(held) = self.held(msg.index) {
                    *held = false;
                }
                if self.ack_term {
                    vec![reply(Action::TermAck)]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_signal(&mut self, _index: usize, bits: u32) -> Option<u32> {
        Some(bits)
    }
}

struct Inner {
    region: Arc<SharedRegion>,
    version: u32,
    rings: Mutex<u64>,
    rung: Condvar,
    host_irq: Mutex<Option<HostIrq>>,
    producer: Mutex<()>,
    consumer: Mutex<()>,
    signals: Mutex<[u32; MAX_SESSIONS]>,
    stop: AtomicBool,
}

/// Secure-world side of one shared region
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct MockSecureWorld {
    inner: Arc<Inner>,
}

impl Doorbell for MockSecureWorld {
    fn ring(&self) {
        *self.inner.rings.lock() += 1;
        self.inner.rung.notify_all();
    }
}

impl MockSecureWorld {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self::with_version(region, PROTOCOL_VERSION)
    }

    /// Peer reporting `version` during the handshake
    pub fn with_version(region: Arc<SharedRegion>, version: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                region,
                version,
                rings: Mutex::new(0),
                rung: Condvar::new(),
                host_irq: Mutex::new(None),
                producer: Mutex::new(()),
                consumer: Mutex::new(()),
                signals: Mutex::new([0; MAX_SESSIONS]),
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.inner.region
    }

    /// Doorbell the host rings to reach this peer
    pub fn doorbell(&self) -> Arc<dyn Doorbell> {
        Arc::new(self.clone())
    }

    /// Interrupt line into the host
    pub fn connect_host<F>(&self, irq: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.host_irq.lock() = Some(Arc::new(irq));
    }

    fn interrupt_host(&self) {
        let irq = self.inner.host_irq.lock().clone();
        if let Some(irq) = irq {
            irq();
        }
    }

    /// How often the host has rung so far
    pub fn doorbell_count(&self) -> u64 {
        *self.inner.rings.lock()
    }

    /// Wait until the count exceeds `seen`; returns the count either way
    pub fn wait_doorbell(&self, seen: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut rings = self.inner.rings.lock();
        while *rings <= seen {
            if self.inner.rung.wait_until(&mut rings, deadline).timed_out() {
                break;
            }
        }
        *rings
    }

    /// Host has published `MAGIC_1` and waits for us
    pub fn handshake_pending(&self) -> bool {
        self.inner.region.control().header.magic() == MAGIC_1
    }

    pub fn is_synchronised(&self) -> bool {
        self.inner.region.control().header.magic() == MAGIC_2
    }

    /// Validate the host header, answer with `MAGIC_2` and interrupt the host
    pub fn complete_handshake(&self) -> Result<()> {
        let header = &self.inner.region.control().header;
        let magic = header.magic();
        if magic != MAGIC_1 {
            return Err(MockError::NotInitialized { magic });
        }

        let reserved_pages = header.reserved_pages();
        let max_sessions = header.max_sessions();
        if usize::from(reserved_pages) != RESERVED_PAGES
            || usize::from(max_sessions) != MAX_SESSIONS
        {
            return Err(MockError::Geometry {
                reserved_pages,
                max_sessions,
            });
        }

        // Per-side state the host does not clear
        *self.inner.signals.lock() = [0; MAX_SESSIONS];

        header.set_version(self.inner.version);
        header.set_magic(MAGIC_2);
        log::debug!("mock: handshake complete, version {:#x}", self.inner.version);
        self.interrupt_host();
        Ok(())
    }

    /// Drain the host's notification word, signal words and ring
    ///
    /// Signal bits are kept for [`take_signals`](Self::take_signals).
    pub fn receive(&self) -> Vec<Message> {
        let control = self.inner.region.control();
        let _consumer = self.inner.consumer.lock();
        control.notif_ns_to_s().take();

        {
            let mut signals = self.inner.signals.lock();
            for (index, pending) in signals.iter_mut().enumerate() {
                if let Ok(word) = control.signal_ns_to_s(index) {
                    *pending |= word.swap(0, Ordering::AcqRel);
                }
            }
        }

        let mut consumer = control.ring_ns_to_s.consumer();
        let mut msgs = Vec::with_capacity(consumer.remaining());
        for record in consumer.by_ref() {
            match record {
                Ok(msg) => msgs.push(msg),
                Err(err) => log::warn!("mock: skipping corrupt record: {err}"),
            }
        }
        consumer.commit();
        msgs
    }

    /// Take the signal bits the host raised for session `index`
    pub fn take_signals(&self, index: usize) -> u32 {
        self.inner
            .signals
            .lock()
            .get_mut(index)
            .map_or(0, core::mem::take)
    }

    /// Publish `msgs` to the host as one batch
    pub fn send(&self, msgs: &[Message]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }

        {
            let _producer = self.inner.producer.lock();
            let mut producer = self.inner.region.control().ring_s_to_ns.producer();
            for msg in msgs {
                producer.produce(*msg)?;
            }
            producer.commit();
        }

        self.notify_host(NotifyBits::MESSAGE);
        Ok(())
    }

    /// OR `bits` into the host's signal word for session `index`
    pub fn raise_signal(&self, index: usize, bits: u32) -> Result<()> {
        let word = self.inner.region.control().signal_s_to_ns(index)?;
        if word.fetch_or(bits, Ordering::AcqRel) == 0 {
            self.notify_host(session_bit(index));
        }
        Ok(())
    }

    /// Announce a channel reset
    pub fn request_reset(&self) {
        log::debug!("mock: requesting channel reset");
        self.notify_host(NotifyBits::RESET);
    }

    fn notify_host(&self, bits: NotifyBits) {
        if self.inner.region.control().notif_s_to_ns().raise(bits) {
            self.interrupt_host();
        }
    }

    /// Service name of a by-name CONFIG, read from the session block
    pub fn read_service_name(&self, msg: &Message) -> Option<String> {
        if msg.action != Action::Config || msg.p2 & CONFIG_BY_NAME == 0 {
            return None;
        }

        let first_page = (msg.p1 >> 16) as usize;
        let offset = first_page * PAGE_SIZE + usize::try_from(msg.p0).ok()?;
        let mut raw = [0u8; NAME_LIMIT];
        self.inner.region.read_bytes(offset, &mut raw).ok()?;

        let len = raw.iter().position(|b| *b == 0)?;
        String::from_utf8(raw[..len].to_vec()).ok()
    }

    /// Run `behavior` on a background thread until [`stop`](Self::stop)
    ///
    /// The thread answers handshakes on its own and only holds a weak
    /// reference, so it also ends once every handle is dropped.
    pub fn serve<B>(&self, behavior: B) -> Result<()>
    where
        B: PeerBehavior + Send + 'static,
    {
        self.inner.stop.store(false, Ordering::Release);
        let weak = Arc::downgrade(&self.inner);

        thread::Builder::new()
            .name("ree-mock-peer".into())
            .spawn(move || Self::service_loop(weak, behavior))?;
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.rung.notify_all();
    }

    fn service_loop<B: PeerBehavior>(weak: Weak<Inner>, mut behavior: B) {
        let mut seen = 0;

        while let Some(inner) = weak.upgrade() {
            if inner.stop.load(Ordering::Acquire) {
                break;
            }
            let peer = MockSecureWorld { inner };
            seen = peer.wait_doorbell(seen, POLL_INTERVAL);

            if peer.handshake_pending() {
                if let Err(err) = peer.complete_handshake() {
                    log::warn!("mock: handshake failed: {err}");
                }
                continue;
            }
            if !peer.is_synchronised() {
                continue;
            }

            let mut replies = Vec::new();
            for msg in peer.receive() {
                replies.extend(behavior.on_message(&msg));
            }
            if let Err(err) = peer.send(&replies) {
                log::warn!("mock: failed to send replies: {err}");
            }

            for index in 0..MAX_SESSIONS {
                let bits = peer.take_signals(index);
                if bits == 0 {
                    continue;
                }
                if let Some(answer) = behavior.on_signal(index, bits) {
                    if let Err(err) = peer.raise_signal(index, answer) {
                        log::warn!("mock: failed to signal session {index}: {err}");
                    }
                }
            }
        }
        log::debug!("mock: service thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn host_region(pages: usize) -> Arc<SharedRegion> {
        init_logging();
        let region = Arc::new(SharedRegion::new(pages).unwrap());
        region.initialize(PROTOCOL_VERSION);
        region
    }

    #[test]
    fn test_handshake_requires_host_header() {
        init_logging();
        let region = Arc::new(SharedRegion::new(8).unwrap());
        let peer = MockSecureWorld::new(region.clone());
        assert!(matches!(
            peer.complete_handshake(),
            Err(MockError::NotInitialized { magic: 0 })
        ));

        region.initialize(PROTOCOL_VERSION);
        assert!(peer.handshake_pending());
        peer.complete_handshake().unwrap();
        assert!(peer.is_synchronised());
    }

    #[test]
    fn test_handshake_interrupts_host() {
        let peer = MockSecureWorld::with_version(host_region(8), PROTOCOL_VERSION | 7);
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        peer.connect_host(move || *counter.lock() += 1);

        peer.complete_handshake().unwrap();
        assert_eq!(*hits.lock(), 1);
        assert_eq!(peer.region().control().header.version(), PROTOCOL_VERSION | 7);
    }

    #[test]
    fn test_doorbell_counts() {
        let peer = MockSecureWorld::new(host_region(8));
        let bell = peer.doorbell();
        bell.ring();
        bell.ring();
        assert_eq!(peer.doorbell_count(), 2);
        assert_eq!(peer.wait_doorbell(2, Duration::from_millis(5)), 2);
        assert_eq!(peer.wait_doorbell(0, Duration::from_secs(1)), 2);
    }

    #[test]
    fn test_receive_collects_messages_and_signals() {
        let region = host_region(8);
        let peer = MockSecureWorld::new(region.clone());
        let control = region.control();

        let mut producer = control.ring_ns_to_s.producer();
        producer
            .produce(Message::new(2, Action::Request).with_payload(5, 0))
            .unwrap();
        producer.commit();
        control.signal_ns_to_s(2).unwrap().fetch_or(0b101, Ordering::AcqRel);
        control.notif_ns_to_s().raise(NotifyBits::MESSAGE | session_bit(2));

        let msgs = peer.receive();
        assert_eq!(msgs, vec![Message::new(2, Action::Request).with_payload(5, 0)]);
        assert_eq!(peer.take_signals(2), 0b101);
        assert_eq!(peer.take_signals(2), 0);
        assert!(control.notif_ns_to_s().peek().is_empty());
    }

    #[test]
    fn test_send_notifies_once_until_drained() {
        let peer = MockSecureWorld::new(host_region(8));
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        peer.connect_host(move || *counter.lock() += 1);

        peer.send(&[Message::new(0, Action::ConfigAck)]).unwrap();
        peer.raise_signal(0, 1).unwrap();
        peer.send(&[Message::new(1, Action::ConfigAck)]).unwrap();
        assert_eq!(*hits.lock(), 1);

        let pending = peer.region().control().notif_s_to_ns().take();
        assert_eq!(pending, NotifyBits::MESSAGE | session_bit(0));
        assert_eq!(peer.region().control().ring_s_to_ns.len(), 2);

        peer.request_reset();
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_read_service_name() {
        let region = host_region(8);
        let peer = MockSecureWorld::new(region.clone());
        let base = RESERVED_PAGES * PAGE_SIZE;
        region.write_bytes(base + 100, b"echo.svc\0").unwrap();

        let msg = Message::new(0, Action::Config)
            .with_payload(100, ((RESERVED_PAGES as u32) << 16) | 1)
            .with_flags(CONFIG_BY_NAME);
        assert_eq!(peer.read_service_name(&msg).as_deref(), Some("echo.svc"));
        assert_eq!(peer.read_service_name(&msg.with_flags(0)), None);
    }

    #[test]
    fn test_echo_service() {
        let mut echo = EchoService::new();
        let answer = echo.on_message(&Message::new(1, Action::Request).with_payload(41, 9));
        assert_eq!(
            answer,
            vec![Message::new(1, Action::Response).with_payload(42, 9)]
        );
        // Already answered: nothing to cancel
        assert!(echo.on_message(&Message::new(1, Action::Cancel)).is_empty());

        let mut holding = EchoService::new().holding_requests().rejecting(3).without_term_ack();
        assert!(holding.on_message(&Message::new(1, Action::Request)).is_empty());
        assert_eq!(
            holding.on_message(&Message::new(1, Action::Cancel)),
            vec![Message::new(1, Action::CancelAck)]
        );
        assert_eq!(
            holding.on_message(&Message::new(1, Action::Config)),
            vec![Message::new(1, Action::ConfigAck).with_payload(0, 3)]
        );
        assert!(holding.on_message(&Message::new(1, Action::Term)).is_empty());
        assert_eq!(holding.on_signal(1, 4), Some(4));
    }
}
