//! Bounded, drop-oldest FIFO between frame producers and consumers.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Default capacity used for completed-frame queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Fixed-capacity FIFO that never blocks producers.
///
/// When full, [`push`](Self::push) discards the oldest entry, so the queue
/// always holds the most recently pushed frames. [`pop`](Self::pop) blocks
/// until an entry arrives or the queue is closed.
#[derive(Debug)]
pub struct BoundedFrameQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> BoundedFrameQueue<T> {
    /// Create a queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one if the queue is full.
    ///
    /// Pushing to a closed queue discards the entry.
    pub fn push(&self, item: T) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.items.len() == self.capacity {
            state.items.pop_front();
            state.dropped += 1;
            tracing::trace!(capacity = self.capacity, "queue full, dropped oldest frame");
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
    }

    /// Remove the oldest entry, blocking while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_for(&mut state, timeout).timed_out() {
                return state.items.pop_front();
            }
        }
    }

    /// Remove the oldest entry without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wake all blocked consumers; later pushes are discarded.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries discarded by drop-oldest admission so far.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl<T> Default for BoundedFrameQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
