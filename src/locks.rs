//! Per-object unpacking locks.
//!
//! At most one token per uid is outstanding at any time, so two submissions
//! of the same content (or one embedded file reached through two extraction
//! paths) never unpack concurrently. Locks on different uids never contend.
//!
//! Waiters block on a condition variable. A bounded wait that expires returns
//! [`PipelineError::LockTimeout`]; shutting the manager down wakes every waiter
//! with [`PipelineError::LocksShutDown`] instead of leaving it blocked.

use crate::core::Uid;
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Exclusive claim on one uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    uid: Uid,
    serial: u64,
}

impl LockToken {
    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

/// Counters proving acquire/release balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LockStats {
    pub held: usize,
    pub acquired: u64,
    pub released: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<Uid, u64>,
    shut_down: bool,
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    next_serial: AtomicU64,
    acquired: AtomicU64,
    releases: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the lock on `uid` is free, without a bound.
    pub fn acquire(&self, uid: &Uid) -> Result<LockToken> {
        self.acquire_until(uid, None)
    }

    /// Wait at most `timeout` for the lock on `uid`.
    pub fn acquire_timeout(&self, uid: &Uid, timeout: Duration) -> Result<LockToken> {
        self.acquire_until(uid, Some(Instant::now() + timeout))
    }

    /// Take the lock only if nobody holds it.
    pub fn try_acquire(&self, uid: &Uid) -> Result<Option<LockToken>> {
        let mut table = self.table.lock();
        if table.shut_down {
            return Err(PipelineError::LocksShutDown);
        }
        if table.held.contains_key(uid) {
            return Ok(None);
        }
        Ok(Some(self.grant(&mut table, uid)))
    }

    /// Bounded acquire returning a guard that releases on drop, unwinding included.
    pub fn acquire_guard(self: &Arc<Self>, uid: &Uid, timeout: Duration) -> Result<LockGuard> {
        let token = self.acquire_timeout(uid, timeout)?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            token: Some(token),
        })
    }

    fn acquire_until(&self, uid: &Uid, deadline: Option<Instant>) -> Result<LockToken> {
        let start = Instant::now();
        let mut table = self.table.lock();
        loop {
            if table.shut_down {
                return Err(PipelineError::LocksShutDown);
            }
            if !table.held.contains_key(uid) {
                return Ok(self.grant(&mut table, uid));
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        let waited_ms = start.elapsed().as_millis() as u64;
                        debug!(uid = %uid, waited_ms, "lock wait expired");
                        return Err(PipelineError::LockTimeout {
                            uid: uid.clone(),
                            waited_ms,
                        });
                    }
                    self.released.wait_until(&mut table, deadline);
                }
                None => self.released.wait(&mut table),
            }
        }
    }

    fn grant(&self, table: &mut LockTable, uid: &Uid) -> LockToken {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        table.held.insert(uid.clone(), serial);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        trace!(uid = %uid, serial, "lock granted");
        LockToken {
            uid: uid.clone(),
            serial,
        }
    }

    /// Release a token. Returns false when the token was already released or
    /// superseded; such calls change nothing.
    pub fn release(&self, token: &LockToken) -> bool {
        let mut table = self.table.lock();
        if table.held.get(&token.uid) != Some(&token.serial) {
            return false;
        }
        table.held.remove(&token.uid);
        self.releases.fetch_add(1, Ordering::Relaxed);
        drop(table);
        self.released.notify_all();
        trace!(uid = %token.uid, serial = token.serial, "lock released");
        true
    }

    pub fn is_locked(&self, uid: &Uid) -> bool {
        self.table.lock().held.contains_key(uid)
    }

    /// Fail current and future acquirers. Tokens still held stay valid, so
    /// work that outlives the shutdown releases them and keeps the counters
    /// balanced.
    pub fn shutdown(&self) {
        let mut table = self.table.lock();
        if table.shut_down {
            return;
        }
        table.shut_down = true;
        let outstanding = table.held.len();
        drop(table);
        self.released.notify_all();
        info!(outstanding, "lock manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.table.lock().shut_down
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            held: self.table.lock().held.len(),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Holds a token until released explicitly or dropped.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<LockManager>,
    token: Option<LockToken>,
}

impl LockGuard {
    pub fn uid(&self) -> Option<&Uid> {
        self.token.as_ref().map(LockToken::uid)
    }

    pub fn release(mut self) -> bool {
        self.token
            .take()
            .is_some_and(|token| self.manager.release(&token))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.manager.release(&token);
        }
    }
}
