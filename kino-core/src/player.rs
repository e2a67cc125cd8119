//! # Player Session
//!
//! Owns everything one open file needs and applies UI events to it.
//!
//! ```text
//!                    ┌──────────────┐
//!  add_event ───────►│ orchestrator │──► MediaState / MediaTrack / Error
//!                    └──────┬───────┘
//!                           │ Seek, TrackSelect, Gpu
//!                    ┌──────▼───────┐
//!  file ────────────►│ demux thread │──► CacheSpeed / SeekChanged
//!                    └──┬────┬────┬─┘
//!               video   │    │    │  subtitle
//!            ┌──────────▼┐ ┌─▼────┴──┐ ┌─────────┐
//!            │  packets  │ │ packets │ │ packets │   one pair per media type
//!            └─────┬─────┘ └────┬────┘ └────┬────┘
//!            ┌─────▼─────┐ ┌────▼────┐ ┌────▼────┐
//!            │  display  │ │ display │ │ display │──► sinks, Position
//!            └───────────┘ └─────────┘ └─────────┘
//! ```
//!
//! The orchestrator is the single writer of the master clock. It picks the
//! audio clock when the file has audio, the video clock otherwise.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};

use crate::audio_output::AudioOutput;
use crate::clock::{Clock, SyncContext};
use crate::codec::{CodecLibrary, HwDevice};
use crate::config::{EngineConfig, QueueConfig, Stage};
use crate::decoder::{Decoder, DecoderStrategy};
use crate::demux::DemuxDispatcher;
use crate::error::{recorder, MediaError, Result};
use crate::event::{Event, EventChannel, MediaState, Notification, NotificationQueue};
use crate::hwaccel;
use crate::media::{Frame, MediaInfo, MediaType, Packet, StreamInfo};
use crate::packet_decoder::PacketStage;
use crate::presenter::{ConsumerCounts, ConsumerStats, Pacer};
use crate::render::{AudioSink, NullAudioSink, SubtitleSink, SubtitleSinks, VideoSink, VideoSinks};
use crate::subtitle_output::SubtitleOutput;
use crate::video_output::VideoOutput;

const ORCHESTRATOR_TICK: Duration = Duration::from_millis(100);

const PLAYABLE: [MediaType; 3] = [MediaType::Video, MediaType::Audio, MediaType::Subtitle];

// ============================================================================
// Stream Pair
// ============================================================================

/// Packet stage plus display stage of one media type.
struct StreamPair {
    clock: Arc<Clock>,
    stats: Arc<ConsumerStats>,
    packets: Decoder<Packet>,
    display: Decoder<Frame>,
}

impl StreamPair {
    fn new(media_type: MediaType, queues: &QueueConfig) -> Self {
        let label = media_type.label();
        Self {
            clock: Clock::new(media_type),
            stats: Arc::new(ConsumerStats::default()),
            packets: Decoder::new(format!("{}-packets", label), media_type, Stage::Packet, queues.clone()),
            display: Decoder::new(format!("{}-display", label), media_type, Stage::Frame, queues.clone()),
        }
    }

    fn stream(&self) -> Option<&StreamInfo> {
        self.display.stream()
    }

    /// Packet stage first: it may be blocked handing a frame to the display.
    fn stop(&mut self) {
        self.packets.stop();
        self.display.stop();
        self.packets.set_downstream(None);
    }

    fn queue_lengths(&self) -> (usize, usize) {
        (self.packets.queue_len(), self.display.queue_len())
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    info: MediaInfo,
    demux: DemuxDispatcher,
    pairs: HashMap<MediaType, StreamPair>,
    device: Option<Arc<dyn HwDevice>>,
    gpu: bool,
    volume: f32,
    muted: bool,
    paused: bool,
    end_reported: bool,
}

impl Session {
    fn stop(&mut self) {
        self.demux.stop();
        for pair in self.pairs.values_mut() {
            pair.stop();
        }
    }

    fn pending_units(&self) -> usize {
        self.pairs
            .values()
            .map(|p| {
                let (packets, frames) = p.queue_lengths();
                packets + frames
            })
            .sum()
    }
}

struct PlayerShared {
    config: EngineConfig,
    library: Arc<dyn CodecLibrary>,
    sync: Arc<SyncContext>,
    notifications: NotificationQueue<Notification>,
    video_sinks: Arc<VideoSinks>,
    subtitle_sinks: Arc<SubtitleSinks>,
    audio_sink: RwLock<Arc<dyn AudioSink>>,
    control: EventChannel,
    running: AtomicBool,
    session: Mutex<Option<Session>>,
    state: Mutex<MediaState>,
}

impl PlayerShared {
    fn set_state(&self, state: MediaState) {
        let mut current = self.state.lock();
        if *current == state {
            return;
        }
        *current = state;
        drop(current);
        tracing::debug!("Media state: {:?}", state);
        self.notifications.publish(Notification::MediaState(state));
    }

    fn report(&self, error: &MediaError) {
        let message = recorder().record(error);
        self.notifications.publish(Notification::Error(message));
    }

    /// (Re)start the pair of `media_type` on `stream`. `None` leaves it inert.
    fn start_pair(&self, session: &mut Session, media_type: MediaType, stream: Option<StreamInfo>) -> Result<()> {
        let queues = &self.config.queue;
        let pair = session
            .pairs
            .entry(media_type)
            .or_insert_with(|| StreamPair::new(media_type, queues));

        if let Some(old) = pair.stream().map(|s| s.index) {
            session.demux.remove_route(old);
        }
        pair.stop();

        let Some(stream) = stream else {
            return Ok(());
        };

        let device = if media_type == MediaType::Video && session.gpu {
            session.device.clone()
        } else {
            None
        };
        let decoder = match self.library.create_decoder(&stream, device.clone()) {
            Ok(decoder) => decoder,
            Err(e) if device.is_some() => {
                tracing::warn!("Hardware decoder for stream {} failed ({}), using software", stream.index, e);
                self.library.create_decoder(&stream, None)?
            }
            Err(e) => return Err(e),
        };
        let on_gpu = decoder.is_hardware();

        let interval = Duration::from_millis(self.config.player.position_interval_ms);
        let pacer = Pacer::new(pair.clock.clone(), self.sync.clone(), pair.stats.clone())
            .with_reporter(self.notifications.clone(), interval);
        let strategy: Box<dyn DecoderStrategy<Frame>> = match media_type {
            MediaType::Video => Box::new(VideoOutput::new(
                pacer,
                self.video_sinks.clone(),
                device,
                self.notifications.clone(),
            )),
            MediaType::Audio => Box::new(AudioOutput::new(pacer, self.audio_sink.read().clone(), session.volume)),
            _ => Box::new(SubtitleOutput::new(pacer, self.subtitle_sinks.clone())),
        };
        pair.display.start(Some(stream.clone()), strategy)?;

        let seek_timeout = Duration::from_millis(self.config.player.seek_timeout_ms);
        let stage = PacketStage::new(decoder, pair.display.handle(), self.notifications.clone(), seek_timeout);
        pair.packets.start(Some(stream.clone()), Box::new(stage))?;
        pair.packets.set_downstream(Some(pair.display.handle().interruptible()));
        session.demux.set_route(stream.index, pair.packets.handle());

        if session.paused {
            pair.display.add_event(Event::Pause(true));
        }
        if media_type == MediaType::Audio && session.muted {
            pair.display.add_event(Event::Mute(true));
        }
        tracing::info!(
            "{} stream {} ({}) started{}",
            media_type.label(),
            stream.index,
            stream.codec,
            if on_gpu { " on GPU" } else { "" }
        );
        Ok(())
    }

    fn restart_at_position(&self, session: &mut Session, media_type: MediaType, stream: Option<StreamInfo>) {
        if let Err(e) = self.start_pair(session, media_type, stream) {
            self.report(&e);
            return;
        }
        let position = self.sync.position_us().unwrap_or(0).max(0);
        session.end_reported = false;
        session.demux.add_event(Event::seek(position));
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    fn handle_event(&self, session: &mut Session, event: Event) {
        match event {
            Event::Pause(paused) => {
                session.paused = paused;
                for pair in session.pairs.values() {
                    pair.display.add_event(Event::Pause(paused));
                }
                if !session.end_reported {
                    self.set_state(if paused { MediaState::Paused } else { MediaState::Playing });
                }
            }
            Event::Seek { position_us, latch } => {
                let duration = session.info.duration_us;
                let target = if duration > 0 {
                    position_us.clamp(0, duration)
                } else {
                    position_us.max(0)
                };
                session.end_reported = false;
                self.set_state(if session.paused { MediaState::Paused } else { MediaState::Playing });
                session.demux.add_event(Event::Seek {
                    position_us: target,
                    latch,
                });
            }
            Event::Volume(volume) => {
                session.volume = volume.clamp(0.0, 1.0);
                if let Some(pair) = session.pairs.get(&MediaType::Audio) {
                    pair.display.add_event(Event::Volume(session.volume));
                }
            }
            Event::Mute(muted) => {
                session.muted = muted;
                if let Some(pair) = session.pairs.get(&MediaType::Audio) {
                    pair.display.add_event(Event::Mute(muted));
                }
            }
            Event::Speed(speed) => {
                let applied = self.sync.set_speed(speed);
                tracing::info!("Playback speed {:.1}x", applied);
            }
            Event::TrackSelect {
                media_type,
                stream_index,
            } => {
                let stream = session
                    .info
                    .stream(stream_index)
                    .filter(|s| s.media_type == media_type && PLAYABLE.contains(&media_type))
                    .cloned();
                let Some(stream) = stream else {
                    self.report(&MediaError::StreamNotFound(stream_index));
                    return;
                };
                tracing::info!("Switching {} track to stream {}", media_type.label(), stream_index);
                self.restart_at_position(session, media_type, Some(stream));
                self.notifications.publish(Notification::MediaTrack(session.info.clone()));
            }
            Event::Gpu(enabled) => {
                if enabled == session.gpu {
                    return;
                }
                if enabled && session.device.is_none() {
                    session.device = hwaccel::open_device(self.library.as_ref(), None);
                    if session.device.is_none() {
                        self.report(&MediaError::HardwareUnavailable("no device for video decode".into()));
                        return;
                    }
                }
                session.gpu = enabled;
                let stream = session.pairs.get(&MediaType::Video).and_then(|p| p.stream().cloned());
                if stream.is_some() {
                    self.restart_at_position(session, MediaType::Video, stream);
                }
            }
        }
    }

    fn check_end_of_media(&self, session: &mut Session) {
        if session.end_reported || !session.demux.is_eof() || session.pending_units() > 0 {
            return;
        }
        session.end_reported = true;
        tracing::info!("End of media");
        self.set_state(MediaState::EndOfMedia);
    }
}

fn device_active(session: &Session, media_type: MediaType) -> bool {
    media_type == MediaType::Video && session.gpu && session.device.is_some()
}

fn run_orchestrator(shared: Arc<PlayerShared>) {
    tracing::debug!("orchestrator: started");
    while shared.running.load(Ordering::SeqCst) {
        shared.control.wait(ORCHESTRATOR_TICK);
        let events = shared.control.drain();

        let mut guard = shared.session.lock();
        let Some(session) = guard.as_mut() else {
            for event in events {
                event.acknowledge();
            }
            continue;
        };
        for event in events {
            shared.handle_event(session, event);
        }
        shared.check_end_of_media(session);
    }
    tracing::debug!("orchestrator: stopped");
}

// ============================================================================
// Player
// ============================================================================

pub struct Player {
    shared: Arc<PlayerShared>,
    orchestrator: Option<JoinHandle<()>>,
}

impl Player {
    pub fn new(config: EngineConfig, library: Arc<dyn CodecLibrary>) -> Result<Self> {
        config.validate()?;
        let notifications = NotificationQueue::new(config.player.notification_capacity);
        let shared = Arc::new(PlayerShared {
            sync: SyncContext::new(config.sync.clone()),
            config,
            library,
            notifications,
            video_sinks: Arc::new(VideoSinks::new()),
            subtitle_sinks: Arc::new(SubtitleSinks::new()),
            audio_sink: RwLock::new(Arc::new(NullAudioSink::default())),
            control: EventChannel::new(),
            running: AtomicBool::new(false),
            session: Mutex::new(None),
            state: Mutex::new(MediaState::Stopped),
        });
        // No session yet: events are acknowledged and dropped.
        shared.control.close();
        Ok(Self {
            shared,
            orchestrator: None,
        })
    }

    /// Open `path` and start playing it. Any previous session is stopped.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<MediaInfo> {
        self.stop();
        let path = path.as_ref();
        let shared = self.shared.clone();
        shared.set_state(MediaState::Opening);

        let demuxer = match shared.library.open_input(path) {
            Ok(demuxer) => demuxer,
            Err(e) => {
                shared.report(&e);
                shared.set_state(MediaState::Stopped);
                return Err(e);
            }
        };
        let info = demuxer.media_info(path);
        tracing::info!(
            "Opened {} ({}, {} streams, {}us)",
            path.display(),
            info.format_name,
            info.streams.len(),
            info.duration_us
        );

        let config = &shared.config;
        shared.sync.serial_reset();
        shared.sync.set_speed(1.0);

        let mut session = Session {
            info: info.clone(),
            demux: DemuxDispatcher::new(demuxer, shared.sync.clone(), shared.notifications.clone(), config.player.clone()),
            pairs: PLAYABLE
                .iter()
                .map(|&t| (t, StreamPair::new(t, &config.queue)))
                .collect(),
            device: None,
            gpu: config.player.gpu_decode,
            volume: config.player.volume,
            muted: false,
            paused: false,
            end_reported: false,
        };
        if session.gpu {
            session.device = hwaccel::open_device(shared.library.as_ref(), None);
            session.gpu = session.device.is_some();
        }

        let master = if info.default_stream(MediaType::Audio).is_some() {
            MediaType::Audio
        } else {
            MediaType::Video
        };
        for pair in session.pairs.values() {
            pair.clock.reset(&shared.sync, 0);
        }
        shared
            .sync
            .set_master(session.pairs.get(&master).map(|p| p.clock.clone()));

        for media_type in PLAYABLE {
            let stream = info.default_stream(media_type).cloned();
            if let Err(e) = shared.start_pair(&mut session, media_type, stream) {
                shared.report(&e);
            }
        }

        if let Err(e) = session.demux.start() {
            session.stop();
            shared.sync.set_master(None);
            shared.report(&e);
            shared.set_state(MediaState::Stopped);
            return Err(e);
        }

        shared.notifications.publish(Notification::MediaTrack(info.clone()));
        shared.notifications.publish(Notification::Duration(info.duration_us));
        *shared.session.lock() = Some(session);

        shared.control.drain();
        shared.control.reopen();
        shared.running.store(true, Ordering::SeqCst);
        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("kino-orchestrator".into())
            .spawn(move || run_orchestrator(thread_shared));
        match spawned {
            Ok(handle) => self.orchestrator = Some(handle),
            Err(e) => {
                self.stop();
                return Err(MediaError::Io(e));
            }
        }

        shared.set_state(MediaState::Playing);
        Ok(info)
    }

    /// Queue a UI event. Without an open session seek latches are
    /// acknowledged at once.
    pub fn add_event(&self, event: Event) {
        if let Err(event) = self.shared.control.push(event) {
            event.acknowledge();
        }
    }

    /// Stop the session and release every thread it owns.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for event in self.shared.control.close() {
            event.acknowledge();
        }
        if let Some(handle) = self.orchestrator.take() {
            if handle.join().is_err() {
                tracing::error!("orchestrator thread panicked");
            }
        }
        let session = self.shared.session.lock().take();
        if let Some(mut session) = session {
            session.stop();
            self.shared.sync.set_master(None);
            tracing::info!("Closed {}", session.info.path.display());
        }
        self.shared.set_state(MediaState::Stopped);
    }

    pub fn notifications(&self) -> Receiver<Notification> {
        self.shared.notifications.receiver()
    }

    // ------------------------------------------------------------------------
    // Render targets
    // ------------------------------------------------------------------------

    pub fn set_video_renders(&self, sinks: Vec<Arc<dyn VideoSink>>) {
        self.shared.video_sinks.set(sinks);
    }

    pub fn add_video_render(&self, sink: Arc<dyn VideoSink>) {
        self.shared.video_sinks.add(sink);
    }

    pub fn set_subtitle_sinks(&self, sinks: Vec<Arc<dyn SubtitleSink>>) {
        self.shared.subtitle_sinks.set(sinks);
    }

    pub fn add_subtitle_sink(&self, sink: Arc<dyn SubtitleSink>) {
        self.shared.subtitle_sinks.add(sink);
    }

    /// Used by audio streams started from now on.
    pub fn set_audio_output(&self, sink: Arc<dyn AudioSink>) {
        *self.shared.audio_sink.write() = sink;
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.shared.session.lock().as_ref().map(|s| s.info.clone())
    }

    pub fn state(&self) -> MediaState {
        *self.shared.state.lock()
    }

    pub fn position_us(&self) -> Option<i64> {
        self.shared.sync.position_us()
    }

    pub fn sync(&self) -> &Arc<SyncContext> {
        &self.shared.sync
    }

    pub fn stats(&self, media_type: MediaType) -> ConsumerCounts {
        self.with_pair(media_type, |p| p.stats.counts()).unwrap_or_default()
    }

    /// Currently playing stream of a media type.
    pub fn selected_stream(&self, media_type: MediaType) -> Option<usize> {
        self.with_pair(media_type, |p| p.stream().map(|s| s.index)).flatten()
    }

    /// `(packet queue, frame queue)` lengths of a media type.
    pub fn queue_lengths(&self, media_type: MediaType) -> Option<(usize, usize)> {
        self.with_pair(media_type, StreamPair::queue_lengths)
    }

    pub fn clock_serial(&self, media_type: MediaType) -> Option<u64> {
        self.with_pair(media_type, |p| p.clock.serial())
    }

    pub fn is_gpu_decoding(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .map(|s| device_active(s, MediaType::Video))
            .unwrap_or(false)
    }

    fn with_pair<R>(&self, media_type: MediaType, f: impl FnOnce(&StreamPair) -> R) -> Option<R> {
        let guard = self.shared.session.lock();
        guard.as_ref().and_then(|s| s.pairs.get(&media_type)).map(f)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}
