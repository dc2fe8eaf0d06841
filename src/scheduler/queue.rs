//! Blocking priority intake queue shared by a stage's workers.
//!
//! Higher priority is dequeued first; equal priorities come out in arrival
//! order. The queue also tracks how many popped items are still being worked
//! on, which is what makes draining possible: after `close`, workers keep
//! popping until the queue is empty *and* no in-flight item can push more.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

struct Entry<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
    active: usize,
    closed: bool,
    aborted: bool,
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Closed,
    Aborted,
}

pub struct IntakeQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    idle: Condvar,
}

impl<T> Default for IntakeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntakeQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                active: 0,
                closed: false,
                aborted: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// External push; refused once the queue is closed.
    pub fn push(&self, item: T, priority: i32) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(PushError::Aborted);
        }
        if state.closed {
            return Err(PushError::Closed);
        }
        Self::insert(&mut state, item, priority);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Push from inside the pipeline; still accepted while draining.
    pub fn push_internal(&self, item: T, priority: i32) -> Result<(), PushError> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(PushError::Aborted);
        }
        Self::insert(&mut state, item, priority);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn insert(state: &mut QueueState<T>, item: T, priority: i32) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            priority,
            seq,
            item,
        });
    }

    /// Block until an item is available. `None` means the worker should exit.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return None;
            }
            if let Some(entry) = state.heap.pop() {
                state.active += 1;
                return Some(entry.item);
            }
            if state.closed && state.active == 0 {
                drop(state);
                self.available.notify_all();
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Mark one popped item as finished.
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.heap.is_empty() {
            drop(state);
            self.idle.notify_all();
            self.available.notify_all();
        }
    }

    /// Stop accepting external pushes and let workers exit once drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Drop everything queued and release all workers. Returns the dropped count.
    pub fn abort(&self) -> usize {
        let mut state = self.state.lock();
        state.aborted = true;
        state.closed = true;
        let dropped = state.heap.len();
        state.heap.clear();
        drop(state);
        self.available.notify_all();
        self.idle.notify_all();
        dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.heap.is_empty() && state.active == 0
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !(state.heap.is_empty() && state.active == 0) {
            if state.aborted {
                return false;
            }
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.heap.is_empty() && state.active == 0;
            }
        }
        true
    }
}
