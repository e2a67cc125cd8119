//! # Decoder - Generic Stage Thread
//!
//! One background thread that owns a bounded input queue and an event
//! channel. Per-media-type behaviour is supplied by a [`DecoderStrategy`].
//!
//! ```text
//!            add_event ──► EventChannel ─┐
//!                                        ▼
//! append ──► BoundedQueue<T> ──► run loop ──► strategy.handle_unit(unit)
//!                                        │
//!                      Seek: clear queue, strategy.on_seek, count down latch
//! ```
//!
//! A decoder started without a stream is inert: appends are dropped and
//! seek latches are acknowledged on arrival, so an absent subtitle track
//! never stalls a coordinated seek.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{QueueConfig, Stage};
use crate::error::{recorder, MediaError, Result};
use crate::event::{Event, EventChannel};
use crate::media::{MediaType, StreamInfo};
use crate::queue::{BoundedQueue, Interruptible};

/// Upper bound for one idle wait while a stage is paused.
const PAUSED_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Strategy
// ============================================================================

/// Per-media-type behaviour plugged into a [`Decoder`].
pub trait DecoderStrategy<T>: Send + 'static {
    fn on_start(&mut self, _stage: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Called for every non-seek event.
    fn handle_event(&mut self, _stage: &StageContext, _event: &Event) {}

    /// Called after the input queue was cleared for a seek.
    fn on_seek(&mut self, _stage: &StageContext, _position_us: i64) {}

    fn handle_unit(&mut self, stage: &StageContext, unit: T);

    fn on_stop(&mut self, _stage: &StageContext) {}

    /// While true the stage does not take data, it only waits for events.
    fn is_paused(&self) -> bool {
        false
    }
}

/// What a strategy sees of its own stage.
pub struct StageContext {
    name: String,
    stream: StreamInfo,
    events: Arc<EventChannel>,
    running: Arc<AtomicBool>,
}

impl StageContext {
    pub(crate) fn new(
        name: impl Into<String>,
        stream: StreamInfo,
        events: Arc<EventChannel>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            stream,
            events,
            running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_pending_events(&self) -> bool {
        self.events.has_pending()
    }

    pub fn has_pending_seek(&self) -> bool {
        self.events.has_pending_seek()
    }

    /// Cancellable pacing wait. Returns true if the full duration elapsed,
    /// false if an event arrived or the stage is stopping.
    pub fn wait(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_running();
        }
        let woken = self.events.wait(duration);
        !woken && self.is_running()
    }

    /// Like [`wait`](Self::wait), but only a seek or a stop cuts it short.
    /// Other events stay queued until the wait is over.
    pub fn wait_unless_seek(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_running();
        }
        let cut = self.events.wait_for_seek(duration);
        !cut && self.is_running()
    }
}

// ============================================================================
// Shared State
// ============================================================================

struct DecoderShared<T> {
    queue: Arc<BoundedQueue<T>>,
    events: Arc<EventChannel>,
    running: Arc<AtomicBool>,
    downstream: Mutex<Option<Arc<dyn Interruptible>>>,
    units_processed: AtomicU64,
    events_processed: AtomicU64,
}

impl<T: Send + 'static> DecoderShared<T> {
    /// Stop accepting work and release everything waiting on this stage.
    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for event in self.events.close() {
            event.acknowledge();
        }
        self.queue.close();
        self.queue.clear();
        self.queue.wake_consumer();
        self.queue.interrupt_producers();
        self.interrupt_downstream();
    }

    fn interrupt_downstream(&self) {
        if let Some(downstream) = self.downstream.lock().as_ref() {
            downstream.interrupt_producers();
        }
    }
}

#[derive(Debug)]
pub enum AppendError<T> {
    /// The stage is not running; the unit was not queued.
    Closed(T),
    /// The blocked append was released by an event or a downstream stop.
    Interrupted(T),
}

impl<T> AppendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(unit) | Self::Interrupted(unit) => unit,
        }
    }
}

/// Cloneable producer-side view of a running stage.
pub struct DecoderHandle<T> {
    shared: Arc<DecoderShared<T>>,
}

impl<T> Clone for DecoderHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> DecoderHandle<T> {
    pub fn append(&self, unit: T) -> std::result::Result<(), AppendError<T>> {
        self.append_unless(unit, || false)
    }

    /// Blocking append that is also abandoned once `cancel` holds. `cancel`
    /// is checked under the queue lock, so raising it before interrupting
    /// this stage cannot be missed.
    pub fn append_unless(&self, unit: T, cancel: impl Fn() -> bool) -> std::result::Result<(), AppendError<T>> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(AppendError::Closed(unit));
        }
        match self.shared.queue.append_unless(unit, cancel) {
            Ok(()) => Ok(()),
            Err(unit) => {
                if self.shared.queue.is_closed() || !self.shared.running.load(Ordering::SeqCst) {
                    Err(AppendError::Closed(unit))
                } else {
                    Err(AppendError::Interrupted(unit))
                }
            }
        }
    }

    /// Post a control event. A stopped stage acknowledges seek latches at once.
    pub fn add_event(&self, event: Event) {
        if let Err(event) = self.shared.events.push(event) {
            event.acknowledge();
            return;
        }
        self.shared.queue.wake_consumer();
        self.shared.queue.interrupt_producers();
        self.shared.interrupt_downstream();
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue handle for linking this stage as someone else's downstream.
    pub fn interruptible(&self) -> Arc<dyn Interruptible> {
        self.shared.queue.clone()
    }
}

// ============================================================================
// Decoder
// ============================================================================

pub struct Decoder<T: Send + 'static> {
    name: String,
    media_type: MediaType,
    stage: Stage,
    queue_config: QueueConfig,
    shared: Arc<DecoderShared<T>>,
    stream: Option<StreamInfo>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Decoder<T> {
    pub fn new(name: impl Into<String>, media_type: MediaType, stage: Stage, queue_config: QueueConfig) -> Self {
        let capacity = queue_config.capacity(stage, media_type);
        let shared = Arc::new(DecoderShared {
            queue: Arc::new(BoundedQueue::new(capacity)),
            events: Arc::new(EventChannel::new()),
            running: Arc::new(AtomicBool::new(false)),
            downstream: Mutex::new(None),
            units_processed: AtomicU64::new(0),
            events_processed: AtomicU64::new(0),
        });
        // Not started yet: behave like a stopped stage.
        shared.events.close();
        shared.queue.close();

        Self {
            name: name.into(),
            media_type,
            stage,
            queue_config,
            shared,
            stream: None,
            thread: None,
        }
    }

    /// Launch the stage thread for `stream`. `None` leaves the decoder inert.
    pub fn start(&mut self, stream: Option<StreamInfo>, strategy: Box<dyn DecoderStrategy<T>>) -> Result<()> {
        self.stop();

        let Some(stream) = stream else {
            tracing::debug!("{}: no stream selected, decoder stays inert", self.name);
            return Ok(());
        };
        if stream.media_type != self.media_type {
            return Err(MediaError::StreamNotFound(stream.index));
        }

        let capacity = self.queue_config.capacity(self.stage, self.media_type);
        let shared = &self.shared;
        shared.queue.set_max_size(capacity);
        shared.queue.clear();
        shared.queue.reopen();
        shared.events.drain();
        shared.events.reopen();
        shared.running.store(true, Ordering::SeqCst);

        let stage = StageContext::new(
            self.name.clone(),
            stream.clone(),
            shared.events.clone(),
            shared.running.clone(),
        );
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("kino-{}", self.name))
            .spawn(move || run_stage(thread_shared, strategy, stage));

        match handle {
            Ok(handle) => {
                tracing::debug!(
                    "{}: started on stream {} ({}, queue {})",
                    self.name,
                    stream.index,
                    stream.codec,
                    capacity
                );
                self.thread = Some(handle);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                shared.shutdown();
                Err(MediaError::Io(e))
            }
        }
    }

    /// Signal shutdown, release every blocked wait and join the thread.
    pub fn stop(&mut self) {
        self.shared.shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("{}: stage thread panicked", self.name);
            }
            tracing::debug!("{}: stopped", self.name);
        }
        self.stream = None;
    }

    /// Queue a unit. Units for an inert decoder are dropped silently.
    pub fn append(&self, unit: T) -> std::result::Result<(), AppendError<T>> {
        if self.stream.is_none() {
            return Ok(());
        }
        self.handle().append(unit)
    }

    pub fn add_event(&self, event: Event) {
        self.handle().add_event(event);
    }

    pub fn handle(&self) -> DecoderHandle<T> {
        DecoderHandle {
            shared: self.shared.clone(),
        }
    }

    /// Events posted here also release this stage's blocked hand-off into
    /// `downstream`.
    pub fn set_downstream(&self, downstream: Option<Arc<dyn Interruptible>>) {
        *self.shared.downstream.lock() = downstream;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn stream(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.size()
    }

    pub fn queue_capacity(&self) -> usize {
        self.shared.queue.max_size()
    }

    pub fn units_processed(&self) -> u64 {
        self.shared.units_processed.load(Ordering::Relaxed)
    }

    pub fn events_processed(&self) -> u64 {
        self.shared.events_processed.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Drop for Decoder<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stage<T: Send + 'static>(
    shared: Arc<DecoderShared<T>>,
    mut strategy: Box<dyn DecoderStrategy<T>>,
    stage: StageContext,
) {
    if let Err(e) = strategy.on_start(&stage) {
        recorder().record(&e);
        shared.shutdown();
        return;
    }

    while stage.is_running() {
        for event in shared.events.drain() {
            match &event {
                Event::Seek { position_us, .. } => {
                    let dropped = shared.queue.clear();
                    tracing::debug!("{}: seek to {}us, dropped {} units", stage.name, position_us, dropped);
                    strategy.on_seek(&stage, *position_us);
                }
                other => strategy.handle_event(&stage, other),
            }
            shared.events_processed.fetch_add(1, Ordering::Relaxed);
            event.acknowledge();
        }
        if !stage.is_running() {
            break;
        }

        if strategy.is_paused() {
            shared.events.wait(PAUSED_POLL);
            continue;
        }

        if let Some(unit) = shared.queue.take() {
            strategy.handle_unit(&stage, unit);
            shared.units_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    strategy.on_stop(&stage);
    shared.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::CountdownLatch;
    use crate::media::Rational;
    use crossbeam_channel::{unbounded, Sender};
    use std::time::Instant;

    struct Collect {
        tx: Sender<u32>,
        seeks: Sender<i64>,
        delay: Duration,
    }

    impl DecoderStrategy<u32> for Collect {
        fn on_seek(&mut self, _stage: &StageContext, position_us: i64) {
            let _ = self.seeks.send(position_us);
        }

        fn handle_unit(&mut self, stage: &StageContext, unit: u32) {
            stage.wait(self.delay);
            let _ = self.tx.send(unit);
        }
    }

    fn audio_stream() -> StreamInfo {
        StreamInfo::new(1, MediaType::Audio, "pcm_s16le", Rational::new(1, 48_000))
    }

    fn small_queues() -> QueueConfig {
        QueueConfig {
            audio_frames: 2,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_units_flow_in_order() {
        let (tx, rx) = unbounded();
        let (seeks, _seek_rx) = unbounded();
        let mut decoder = Decoder::new("audio", MediaType::Audio, Stage::Frame, small_queues());
        decoder
            .start(Some(audio_stream()), Box::new(Collect { tx, seeks, delay: Duration::ZERO }))
            .unwrap();
        assert_eq!(decoder.queue_capacity(), 2);

        for i in 0..10 {
            decoder.append(i).unwrap();
        }
        let got: Vec<u32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        decoder.stop();
        assert!(!decoder.is_running());
    }

    #[test]
    fn test_inert_decoder() {
        let mut decoder = Decoder::<u32>::new("subtitle", MediaType::Subtitle, Stage::Frame, QueueConfig::default());
        let (tx, _rx) = unbounded();
        let (seeks, _s) = unbounded();
        decoder
            .start(None, Box::new(Collect { tx, seeks, delay: Duration::ZERO }))
            .unwrap();
        assert!(decoder.append(1).is_ok());
        assert_eq!(decoder.queue_len(), 0);

        let latch = Arc::new(CountdownLatch::new(1));
        decoder.add_event(Event::Seek {
            position_us: 0,
            latch: Some(latch.clone()),
        });
        assert!(latch.is_released());
    }

    #[test]
    fn test_wrong_media_type_rejected() {
        let mut decoder = Decoder::<u32>::new("video", MediaType::Video, Stage::Frame, QueueConfig::default());
        let (tx, _rx) = unbounded();
        let (seeks, _s) = unbounded();
        let err = decoder
            .start(Some(audio_stream()), Box::new(Collect { tx, seeks, delay: Duration::ZERO }))
            .unwrap_err();
        assert!(matches!(err, MediaError::StreamNotFound(1)));
    }

    #[test]
    fn test_seek_clears_queue_and_acknowledges() {
        let (tx, rx) = unbounded();
        let (seeks, seek_rx) = unbounded();
        let mut decoder = Decoder::new("audio", MediaType::Audio, Stage::Frame, small_queues());
        decoder
            .start(
                Some(audio_stream()),
                Box::new(Collect { tx, seeks, delay: Duration::from_millis(200) }),
            )
            .unwrap();
        decoder.append(1).unwrap();
        decoder.append(2).unwrap();

        let latch = Arc::new(CountdownLatch::new(1));
        decoder.add_event(Event::Seek {
            position_us: 5_000_000,
            latch: Some(latch.clone()),
        });
        assert!(latch.wait_timeout(Duration::from_secs(2)));
        assert_eq!(seek_rx.recv_timeout(Duration::from_secs(1)).unwrap(), 5_000_000);
        assert_eq!(decoder.queue_len(), 0);
        assert_eq!(decoder.events_processed(), 1);

        decoder.stop();
        // at most the unit in flight when the seek arrived got through
        assert!(rx.try_iter().count() <= 1);
    }

    #[test]
    fn test_stop_releases_blocked_append() {
        let (tx, _rx) = unbounded();
        let (seeks, _s) = unbounded();
        let mut decoder = Decoder::new("audio", MediaType::Audio, Stage::Frame, small_queues());
        decoder
            .start(
                Some(audio_stream()),
                Box::new(Collect { tx, seeks, delay: Duration::from_secs(30) }),
            )
            .unwrap();

        let handle = decoder.handle();
        let producer = thread::spawn(move || {
            let mut result = Ok(());
            for i in 0..10 {
                result = handle.append(i);
                if result.is_err() {
                    break;
                }
            }
            result.map_err(|e| matches!(e, AppendError::Closed(_)))
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!producer.is_finished());

        let started = Instant::now();
        decoder.stop();
        assert_eq!(producer.join().unwrap(), Err(true));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_latch_acknowledged_by_stopped_decoder() {
        let (tx, _rx) = unbounded();
        let (seeks, _s) = unbounded();
        let mut decoder = Decoder::new("audio", MediaType::Audio, Stage::Frame, small_queues());
        decoder
            .start(Some(audio_stream()), Box::new(Collect { tx, seeks, delay: Duration::ZERO }))
            .unwrap();
        let handle = decoder.handle();
        decoder.stop();

        let latch = Arc::new(CountdownLatch::new(1));
        handle.add_event(Event::Seek {
            position_us: 1,
            latch: Some(latch.clone()),
        });
        assert!(latch.wait_timeout(Duration::from_millis(100)));
    }
}
