//! # Bounded Queue - Back-Pressured Stage Hand-Off
//!
//! Capacity-limited FIFO between exactly one producer and one consumer
//! thread. Back-pressure is the only flow control: `append` blocks while the
//! queue is full and nothing is ever evicted except by an explicit `clear`.
//!
//! ```text
//! ┌──────────┐ append  ┌──────────────┐  take  ┌──────────┐
//! │ Producer │────────►│ BoundedQueue │───────►│ Consumer │
//! └──────────┘ (block) └──────────────┘ (block)└──────────┘
//!      ▲                      │                     ▲
//!      └ interrupt_producers ─┴─ wake_consumer ─────┘
//! ```
//!
//! `take` yields `None` as a wake sentinel so a consumer parked on an empty
//! queue re-checks its shutdown flag and pending events. An interrupted
//! `append` hands the item back instead of enqueueing it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Type-erased handle used to release a producer blocked on a downstream queue.
pub trait Interruptible: Send + Sync {
    fn interrupt_producers(&self);
}

impl<T: Send> Interruptible for BoundedQueue<T> {
    fn interrupt_producers(&self) {
        BoundedQueue::interrupt_producers(self);
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    max_size: usize,
    /// Pending force-wake for the consumer; served before any real item.
    wake: bool,
    /// Bumped to release producers blocked on a full queue.
    producer_epoch: u64,
    closed: bool,
}

pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    appended: AtomicU64,
    taken: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(max_size.min(1024)),
                max_size: max_size.max(1),
                wake: false,
                producer_epoch: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            appended: AtomicU64::new(0),
            taken: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Append an item, blocking while the queue is at capacity.
    ///
    /// Returns the item back if the queue is closed or the wait was
    /// interrupted by [`interrupt_producers`](Self::interrupt_producers).
    pub fn append(&self, item: T) -> Result<(), T> {
        self.append_unless(item, || false)
    }

    /// [`append`](Self::append) that also gives up when `cancel` returns
    /// true. `cancel` is evaluated under the queue lock before every wait,
    /// so a cancel condition raised just before an interrupt is never missed.
    pub fn append_unless(&self, item: T, cancel: impl Fn() -> bool) -> Result<(), T> {
        let mut state = self.state.lock();
        let epoch = state.producer_epoch;

        while state.items.len() >= state.max_size {
            if state.closed || state.producer_epoch != epoch || cancel() {
                return Err(item);
            }
            self.not_full.wait(&mut state);
        }
        if state.closed || state.producer_epoch != epoch {
            return Err(item);
        }

        state.items.push_back(item);
        self.appended.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Append without blocking. Fails if full or closed.
    pub fn try_append(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.items.len() >= state.max_size {
            return Err(item);
        }
        state.items.push_back(item);
        self.appended.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Release every producer currently blocked in `append`.
    pub fn interrupt_producers(&self) {
        let mut state = self.state.lock();
        state.producer_epoch = state.producer_epoch.wrapping_add(1);
        self.not_full.notify_all();
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Take the next item, blocking while empty.
    ///
    /// `None` is the wake sentinel: it is returned once per
    /// [`wake_consumer`](Self::wake_consumer) call and whenever the queue is
    /// closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.wake {
                state.wake = false;
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                self.taken.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`take`](Self::take) with an upper bound on the wait.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.wake {
                state.wake = false;
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                self.taken.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            self.taken.fetch_add(1, Ordering::Relaxed);
            self.not_full.notify_one();
        }
        item
    }

    /// Force-wake a consumer blocked in `take`. Buffered items keep their order.
    pub fn wake_consumer(&self) {
        let mut state = self.state.lock();
        state.wake = true;
        self.not_empty.notify_all();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop every buffered item. Blocked producers get room immediately.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.items.len();
        state.items.clear();
        self.not_full.notify_all();
        dropped
    }

    /// Change capacity. Items above a lowered capacity are kept, producers
    /// simply block until the consumer catches up.
    pub fn set_max_size(&self, max_size: usize) {
        let mut state = self.state.lock();
        state.max_size = max_size.max(1);
        self.not_full.notify_all();
    }

    /// Refuse further appends and release both sides.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Re-arm a closed queue for the next activation.
    pub fn reopen(&self) {
        let mut state = self.state.lock();
        state.closed = false;
        state.wake = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.items.len() >= state.max_size
    }

    /// Lifetime (appended, taken) counters.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.appended.load(Ordering::Relaxed),
            self.taken.load(Ordering::Relaxed),
        )
    }
}
