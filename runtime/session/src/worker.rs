//! Notification drain worker
//!
//! One dedicated thread runs [`Channel::process_notifications`]. Triggers go
//! through a one-slot channel: while a run is already queued, further
//! triggers are absorbed, so a burst of interrupts costs at most one extra
//! pass and never more than one pass runs at a time.

use std::sync::Weak;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Sender, TrySendError};

use crate::channel::Channel;
use crate::error::Result;

pub(crate) struct DrainWorker {
    trigger: Sender<()>,
    handle: JoinHandle<()>,
}

impl DrainWorker {
    /// Start the worker thread
    ///
    /// The thread only holds a weak reference and exits once the channel is
    /// gone or the worker is stopped.
    pub(crate) fn spawn(channel: Weak<Channel>) -> Result<Self> {
        let (trigger, runs) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("ree-drain".into())
            .spawn(move || {
                for () in runs.iter() {
                    match channel.upgrade() {
                        Some(channel) => channel.process_notifications(),
                        None => break,
                    }
                }
                log::debug!("ree: drain worker exiting");
            })?;

        Ok(Self { trigger, handle })
    }

    /// Queue a drain pass; `false` if one was already queued
    pub(crate) fn schedule(&self) -> bool {
        match self.trigger.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => {
                log::warn!("ree: drain worker is gone");
                false
            }
        }
    }

    /// Disconnect the trigger and wait for the thread to finish its pass
    pub(crate) fn stop(self) {
        drop(self.trigger);
        if self.handle.join().is_err() {
            log::error!("ree: drain worker panicked");
        }
    }
}
