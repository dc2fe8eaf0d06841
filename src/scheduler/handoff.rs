//! Explicit stage-to-stage hand-off channels.
//!
//! A hand-off is a named crossbeam channel wired at pipeline assembly time.
//! The sending stage keeps a [`Handoff`]; a forwarder thread drains the
//! [`HandoffReceiver`] into the next stage's intake. Messages in transit are
//! counted so idle detection can see work that is between two stages.

use super::pool::Intake;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub struct Handoff<T> {
    name: &'static str,
    tx: Sender<T>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

pub struct HandoffReceiver<T> {
    name: &'static str,
    rx: Receiver<T>,
    pending: Arc<AtomicUsize>,
}

/// Create a named hand-off channel.
pub fn handoff<T>(name: &'static str) -> (Handoff<T>, HandoffReceiver<T>) {
    let (tx, rx) = unbounded();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        Handoff {
            name,
            tx,
            pending: Arc::clone(&pending),
        },
        HandoffReceiver { name, rx, pending },
    )
}

impl<T> Handoff<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns false when the receiving side is gone.
    pub fn send(&self, message: T) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!(handoff = self.name, "hand-off receiver disconnected");
            return false;
        }
        true
    }

    /// Messages sent but not yet accepted by the next stage.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> HandoffReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pending)
    }

    /// Receive directly, for wiring a stage up in isolation.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let message = self.rx.recv_timeout(timeout).ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(message)
    }

    /// Spawn a thread that maps every message to zero or more jobs and feeds
    /// them into `intake` until all senders are dropped.
    pub fn forward_into<J, I, F>(self, intake: Arc<Intake<J>>, map: F) -> io::Result<JoinHandle<()>>
    where
        J: Send + 'static,
        I: IntoIterator<Item = (J, i32)>,
        F: Fn(T) -> I + Send + 'static,
    {
        thread::Builder::new()
            .name(format!("{}-handoff", self.name))
            .spawn(move || {
                for message in self.rx.iter() {
                    for (job, priority) in map(message) {
                        if let Err(e) = intake.submit_internal(job, priority) {
                            warn!(handoff = self.name, error = %e, "dropping hand-off message");
                        }
                    }
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                debug!(handoff = self.name, "hand-off closed");
            })
    }
}
