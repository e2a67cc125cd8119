//! # Demux Dispatch
//!
//! The demux thread reads container packets and routes each one, by stream
//! index, into that stream's packet-stage queue. It also coordinates seeks:
//!
//! ```text
//! Seek(pos) ─► bump serial ─► broadcast Seek + latch to every packet stage
//!                                   │  (each flushes its codec, forwards the
//!                                   │   seek to its display stage and waits)
//!                             latch released (or timeout)
//!                                   ▼
//!                          demuxer.seek(pos) ─► SeekChanged(pos)
//! ```
//!
//! Routes are swapped by the session orchestrator on track changes. The
//! route lock is held only to clone a handle, never across a blocking append.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::clock::SyncContext;
use crate::codec::{CodecError, Demuxer, SeekDirection};
use crate::config::PlayerConfig;
use crate::decoder::{AppendError, DecoderHandle};
use crate::error::{recorder, MediaError, Result};
use crate::event::{Event, EventChannel, Notification, NotificationQueue};
use crate::latch::CountdownLatch;
use crate::media::Packet;

type Routes = RwLock<HashMap<usize, DecoderHandle<Packet>>>;

struct DemuxShared {
    routes: Routes,
    events: EventChannel,
    running: AtomicBool,
    eof: AtomicBool,
    bytes_read: AtomicU64,
    packets_read: AtomicU64,
}

impl DemuxShared {
    fn interrupt_routes(&self) {
        for handle in self.routes.read().values() {
            handle.interruptible().interrupt_producers();
        }
    }
}

pub struct DemuxDispatcher {
    shared: Arc<DemuxShared>,
    worker: Option<DemuxWorker>,
    thread: Option<JoinHandle<()>>,
}

impl DemuxDispatcher {
    /// Packets of streams without a route are dropped, so install the
    /// routes before [`start`](Self::start).
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        sync: Arc<SyncContext>,
        notifications: NotificationQueue<Notification>,
        config: PlayerConfig,
    ) -> Self {
        let shared = Arc::new(DemuxShared {
            routes: RwLock::new(HashMap::new()),
            events: EventChannel::new(),
            running: AtomicBool::new(true),
            eof: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            packets_read: AtomicU64::new(0),
        });

        let worker = DemuxWorker {
            demuxer,
            shared: shared.clone(),
            sync,
            notifications,
            config,
            window_start: Instant::now(),
            window_bytes: 0,
        };

        Self {
            shared,
            worker: Some(worker),
            thread: None,
        }
    }

    /// Spawn the demux thread. Calling it again is a no-op.
    pub fn start(&mut self) -> Result<()> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        let thread = thread::Builder::new()
            .name("kino-demux".into())
            .spawn(move || worker.run())?;
        self.thread = Some(thread);
        Ok(())
    }

    pub fn set_route(&self, stream_index: usize, handle: DecoderHandle<Packet>) {
        self.shared.routes.write().insert(stream_index, handle);
    }

    pub fn remove_route(&self, stream_index: usize) -> Option<DecoderHandle<Packet>> {
        let removed = self.shared.routes.write().remove(&stream_index);
        // A demuxer blocked on the removed stage must not stay blocked.
        if let Some(handle) = &removed {
            handle.interruptible().interrupt_producers();
        }
        removed
    }

    /// Post an event to the demux thread and release it if it is blocked
    /// handing a packet to a full stage.
    pub fn add_event(&self, event: Event) {
        if let Err(event) = self.shared.events.push(event) {
            event.acknowledge();
            return;
        }
        self.shared.interrupt_routes();
    }

    pub fn is_eof(&self) -> bool {
        self.shared.eof.load(Ordering::SeqCst)
    }

    pub fn packets_read(&self) -> u64 {
        self.shared.packets_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for event in self.shared.events.close() {
            event.acknowledge();
        }
        self.shared.interrupt_routes();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("demux thread panicked");
            }
        }
    }
}

impl Drop for DemuxDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Demux Thread
// ============================================================================

struct DemuxWorker {
    demuxer: Box<dyn Demuxer>,
    shared: Arc<DemuxShared>,
    sync: Arc<SyncContext>,
    notifications: NotificationQueue<Notification>,
    config: PlayerConfig,
    window_start: Instant,
    window_bytes: u64,
}

impl DemuxWorker {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn run(&mut self) {
        tracing::debug!("demux: started ({})", self.demuxer.format_name());
        let idle = Duration::from_millis(self.config.idle_sleep_ms.max(1));

        while self.running() {
            for event in self.shared.events.drain() {
                if let Event::Seek { position_us, .. } = &event {
                    self.seek(*position_us);
                }
                event.acknowledge();
            }
            if !self.running() {
                break;
            }

            if self.shared.eof.load(Ordering::SeqCst) {
                self.shared.events.wait(Duration::from_millis(100));
                continue;
            }

            match self.demuxer.read_packet() {
                Ok(packet) => {
                    let size = packet.size() as u64;
                    self.shared.packets_read.fetch_add(1, Ordering::Relaxed);
                    self.shared.bytes_read.fetch_add(size, Ordering::Relaxed);
                    self.window_bytes += size;
                    self.dispatch(packet);
                }
                Err(CodecError::EndOfStream) => {
                    tracing::debug!("demux: end of input after {} packets", self.shared.packets_read.load(Ordering::Relaxed));
                    self.shared.eof.store(true, Ordering::SeqCst);
                    let indices: Vec<usize> = self.shared.routes.read().keys().copied().collect();
                    for index in indices {
                        self.dispatch(Packet::drain(index));
                    }
                }
                Err(CodecError::Again) => {
                    self.shared.events.wait(idle);
                }
                Err(CodecError::Fatal(reason)) => {
                    let message = recorder().record(&MediaError::InvalidState(format!("demux read failed: {}", reason)));
                    self.notifications.publish(Notification::Error(message));
                    self.shared.eof.store(true, Ordering::SeqCst);
                }
            }

            self.sample_cache_speed();
        }
        tracing::debug!("demux: stopped");
    }

    fn dispatch(&self, mut packet: Packet) {
        let handle = self.shared.routes.read().get(&packet.stream_index).cloned();
        let Some(handle) = handle else {
            return;
        };
        // Pending control work (seek, stop) wins over this packet.
        let cancelled = || !self.running() || self.shared.events.has_pending();
        loop {
            match handle.append_unless(packet, &cancelled) {
                Ok(()) => return,
                Err(AppendError::Closed(_)) => return,
                Err(AppendError::Interrupted(back)) => {
                    if cancelled() {
                        return;
                    }
                    packet = back;
                }
            }
        }
    }

    fn seek(&mut self, position_us: i64) {
        let serial = self.sync.serial_ref();
        let handles: Vec<DecoderHandle<Packet>> = self.shared.routes.read().values().cloned().collect();
        tracing::info!("Seek to {}us (serial {}, {} streams)", position_us, serial, handles.len());

        let latch = Arc::new(CountdownLatch::new(handles.len()));
        for handle in &handles {
            handle.add_event(Event::Seek {
                position_us,
                latch: Some(latch.clone()),
            });
        }
        let timeout = Duration::from_millis(self.config.seek_timeout_ms);
        if !latch.wait_timeout(timeout) {
            tracing::warn!("Seek: {} stages did not acknowledge within {:?}", latch.count(), timeout);
        }

        if let Err(e) = self.demuxer.seek(position_us, SeekDirection::Backward) {
            let message = recorder().record(&MediaError::InvalidState(format!("seek to {}us failed: {}", position_us, e)));
            self.notifications.publish(Notification::Error(message));
        }
        self.shared.eof.store(false, Ordering::SeqCst);
        self.notifications.publish(Notification::SeekChanged(position_us));
    }

    fn sample_cache_speed(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_millis(self.config.cache_speed_interval_ms) {
            return;
        }
        let speed = (self.window_bytes as f64 / elapsed.as_secs_f64().max(1e-6)) as u64;
        self.notifications.publish(Notification::CacheSpeed(speed));
        self.window_start = Instant::now();
        self.window_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, Stage, SyncConfig};
    use crate::decoder::{Decoder, DecoderStrategy, StageContext};
    use crate::media::{AudioFormat, ChannelLayout, MediaType, SampleFormat};
    use crate::raw::{generate, KrawDemuxer, SynthAudio, SynthSpec};
    use crossbeam_channel::{unbounded, Sender};

    struct Forward(Sender<Packet>);

    impl DecoderStrategy<Packet> for Forward {
        fn handle_unit(&mut self, _stage: &StageContext, unit: Packet) {
            let _ = self.0.send(unit);
        }
    }

    fn audio_file(dir: &std::path::Path, duration_us: i64) -> std::path::PathBuf {
        let path = dir.join("tone.kraw");
        let spec = SynthSpec {
            duration_us,
            video: None,
            audio: vec![SynthAudio {
                format: AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000),
                samples_per_packet: 512,
            }],
            subtitles: Vec::new(),
            title: None,
        };
        generate(&path, &spec).unwrap();
        path
    }

    fn packet_stage(tx: Sender<Packet>) -> Decoder<Packet> {
        let mut decoder = Decoder::new("audio-packets", MediaType::Audio, Stage::Packet, QueueConfig::default());
        let stream = crate::media::StreamInfo::audio(
            0,
            "pcm_s16le",
            AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000),
        );
        decoder.start(Some(stream), Box::new(Forward(tx))).unwrap();
        decoder
    }

    #[test]
    fn test_dispatch_until_end_of_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(dir.path(), 1_000_000);
        let (tx, rx) = unbounded();
        let stage = packet_stage(tx);

        let notifications = NotificationQueue::new(64);
        let mut demux = DemuxDispatcher::new(
            Box::new(KrawDemuxer::open(&path).unwrap()),
            SyncContext::new(SyncConfig::default()),
            notifications,
            PlayerConfig::default(),
        );
        demux.set_route(0, stage.handle());
        demux.start().unwrap();

        let mut data = 0;
        loop {
            let packet = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            if packet.is_drain() {
                break;
            }
            data += 1;
        }
        // 8000 samples in 512-sample packets
        assert_eq!(data, 16);
        assert!(demux.is_eof());
        assert_eq!(demux.packets_read(), 16);
        assert!(demux.bytes_read() > 0);
        demux.stop();
    }

    #[test]
    fn test_seek_is_coordinated() {
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(dir.path(), 2_000_000);
        let (tx, rx) = unbounded();
        let stage = packet_stage(tx);

        let sync = SyncContext::new(SyncConfig::default());
        let notifications = NotificationQueue::new(64);
        let mut demux = DemuxDispatcher::new(
            Box::new(KrawDemuxer::open(&path).unwrap()),
            sync.clone(),
            notifications.clone(),
            PlayerConfig::default(),
        );
        demux.set_route(0, stage.handle());
        demux.start().unwrap();

        let latch = Arc::new(CountdownLatch::new(1));
        demux.add_event(Event::Seek {
            position_us: 1_000_000,
            latch: Some(latch.clone()),
        });
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        assert_eq!(sync.serial(), 1);

        let seen = notifications
            .receiver()
            .iter()
            .find(|n| matches!(n, Notification::SeekChanged(_)));
        assert_eq!(seen, Some(Notification::SeekChanged(1_000_000)));

        // Reading resumes after the seek and still reaches the end.
        let mut drained = false;
        while let Ok(packet) = rx.recv_timeout(Duration::from_secs(2)) {
            if packet.is_drain() {
                drained = true;
                break;
            }
        }
        assert!(drained);
        demux.stop();
    }

    #[test]
    fn test_unrouted_streams_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = audio_file(dir.path(), 500_000);
        let mut demux = DemuxDispatcher::new(
            Box::new(KrawDemuxer::open(&path).unwrap()),
            SyncContext::new(SyncConfig::default()),
            NotificationQueue::new(8),
            PlayerConfig::default(),
        );
        demux.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !demux.is_eof() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(demux.is_eof());
        assert!(demux.packets_read() > 0);
    }
}
