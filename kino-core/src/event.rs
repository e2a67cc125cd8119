//! # Events and Notifications
//!
//! Control messages travel out-of-band from media data. Each decode stage
//! owns an [`EventChannel`]; the UI side observes the engine through a
//! bounded [`NotificationQueue`].
//!
//! The event channel is unordered with respect to data: a `Seek` posted while
//! a stage is blocked on its queue is observed on the next wake, before the
//! next buffered unit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::latch::CountdownLatch;
use crate::media::{MediaInfo, MediaType};

// ============================================================================
// Events (UI -> engine)
// ============================================================================

#[derive(Debug, Clone)]
pub enum Event {
    Pause(bool),
    Seek {
        position_us: i64,
        /// Counted down once the receiving stage has dropped its stale units.
        latch: Option<Arc<CountdownLatch>>,
    },
    Volume(f32),
    Mute(bool),
    Speed(f64),
    TrackSelect {
        media_type: MediaType,
        stream_index: usize,
    },
    Gpu(bool),
}

impl Event {
    pub fn seek(position_us: i64) -> Self {
        Self::Seek {
            position_us,
            latch: None,
        }
    }

    /// Acknowledge the seek latch, if this event carries one.
    pub fn acknowledge(&self) {
        if let Self::Seek {
            latch: Some(latch), ..
        } = self
        {
            latch.count_down();
        }
    }

    pub fn is_seek(&self) -> bool {
        matches!(self, Self::Seek { .. })
    }
}

struct ChannelState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Thread-safe control channel of one stage.
pub struct EventChannel {
    state: Mutex<ChannelState>,
    signal: Condvar,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                events: VecDeque::new(),
                closed: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Post an event. A closed channel hands it back.
    pub fn push(&self, event: Event) -> Result<(), Event> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(event);
        }
        state.events.push_back(event);
        self.signal.notify_all();
        Ok(())
    }

    pub fn drain(&self) -> Vec<Event> {
        self.state.lock().events.drain(..).collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().events.is_empty()
    }

    pub fn has_pending_seek(&self) -> bool {
        self.state.lock().events.iter().any(Event::is_seek)
    }

    /// Cancellable wait: returns true as soon as an event is pending or the
    /// channel is poked, false once `timeout` elapsed quietly.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if !state.events.is_empty() || state.closed {
            return true;
        }
        let timed_out = self.signal.wait_until(&mut state, deadline).timed_out();
        !timed_out || !state.events.is_empty() || state.closed
    }

    /// Wait out `timeout` unless a seek is posted or the channel closes.
    /// Returns true when cut short.
    pub fn wait_for_seek(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed || state.events.iter().any(Event::is_seek) {
                return true;
            }
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                return state.closed || state.events.iter().any(Event::is_seek);
            }
        }
    }

    /// Wake any waiter without posting an event.
    pub fn notify(&self) {
        let _state = self.state.lock();
        self.signal.notify_all();
    }

    /// Refuse further events and return the ones still pending.
    pub fn close(&self) -> Vec<Event> {
        let mut state = self.state.lock();
        state.closed = true;
        self.signal.notify_all();
        state.events.drain(..).collect()
    }

    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ============================================================================
// Notifications (engine -> UI)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaState {
    Stopped,
    Opening,
    Playing,
    Paused,
    EndOfMedia,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notification {
    Duration(i64),
    Position(i64),
    MediaState(MediaState),
    /// Demux throughput in bytes per second.
    CacheSpeed(u64),
    MediaTrack(MediaInfo),
    SeekChanged(i64),
    Error(String),
}

/// Bounded notification channel. When the observer falls behind, the oldest
/// entry is discarded so the newest state is always delivered.
pub struct NotificationQueue<N> {
    tx: Sender<N>,
    rx: Receiver<N>,
}

impl<N> Clone for NotificationQueue<N> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<N> NotificationQueue<N> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn publish(&self, notification: N) {
        let mut pending = notification;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.rx.try_recv();
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn receiver(&self) -> Receiver<N> {
        self.rx.clone()
    }

    /// Everything published so far.
    pub fn poll(&self) -> Vec<N> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
