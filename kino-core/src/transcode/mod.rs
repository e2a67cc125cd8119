//! # Transcoder
//!
//! Drives one input file through decode, filter and encode into an output
//! container on a dedicated thread, plus a small worker pool for input
//! parsing and preview extraction.
//!
//! ```text
//!            parse_input            start               run ends
//! Idle ──► ParsingInput ──► Ready ──► Running ──► Finished | Stopped ──► (wait) Idle
//! ```

mod context;
mod pipeline;
mod preview;
mod progress;

pub use context::{encoder_settings, EncodeContext, StreamEncode, StreamMode, StreamStats, TranscoderContext, COPY};
pub use preview::{generate_previews, PreviewImage};
pub use progress::{ProgressTracker, TranscodeStats};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::codec::CodecLibrary;
use crate::config::EngineConfig;
use crate::error::{recorder, MediaError, Result};
use crate::event::NotificationQueue;
use crate::media::MediaInfo;

use self::pipeline::Run;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeState {
    Idle,
    ParsingInput,
    Ready,
    Running,
    Finished,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TranscodeNotification {
    State(TranscodeState),
    MediaTrack(MediaInfo),
    Progress(TranscodeStats),
    Error(String),
}

/// Result of one run, returned by [`Transcoder::wait`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeReport {
    pub state: TranscodeState,
    pub stats: TranscodeStats,
}

struct TranscoderShared {
    config: EngineConfig,
    library: Arc<dyn CodecLibrary>,
    notifications: NotificationQueue<TranscodeNotification>,
    state: Mutex<TranscodeState>,
    input: Mutex<Option<MediaInfo>>,
    stop: AtomicBool,
}

impl TranscoderShared {
    fn set_state(&self, state: TranscodeState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Transcoder: {:?} -> {:?}", *current, state);
            *current = state;
            self.notifications.publish(TranscodeNotification::State(state));
        }
    }

    fn report(&self, error: &MediaError) {
        let message = recorder().record(error);
        self.notifications.publish(TranscodeNotification::Error(message));
    }
}

pub struct Transcoder {
    shared: Arc<TranscoderShared>,
    pool: rayon::ThreadPool,
    job: Option<JoinHandle<Result<TranscodeReport>>>,
}

impl Transcoder {
    pub fn new(config: EngineConfig, library: Arc<dyn CodecLibrary>) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.transcode.worker_threads)
            .thread_name(|i| format!("kino-worker-{}", i))
            .build()
            .map_err(|e| MediaError::InvalidState(format!("worker pool: {}", e)))?;

        Ok(Self {
            shared: Arc::new(TranscoderShared {
                notifications: NotificationQueue::new(config.transcode.notification_capacity),
                config,
                library,
                state: Mutex::new(TranscodeState::Idle),
                input: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            pool,
            job: None,
        })
    }

    pub fn state(&self) -> TranscodeState {
        *self.shared.state.lock()
    }

    pub fn notifications(&self) -> Receiver<TranscodeNotification> {
        self.shared.notifications.receiver()
    }

    /// Track list of the last successfully parsed input.
    pub fn media_info(&self) -> Option<MediaInfo> {
        self.shared.input.lock().clone()
    }

    /// Probe `path` on the worker pool. On success the track list is
    /// published and the transcoder becomes Ready.
    pub fn parse_input(&self, path: impl AsRef<Path>) -> Result<Receiver<Result<MediaInfo>>> {
        {
            let mut state = self.shared.state.lock();
            if matches!(*state, TranscodeState::ParsingInput | TranscodeState::Running) {
                return Err(MediaError::InvalidState(format!("cannot parse input while {:?}", *state)));
            }
            *state = TranscodeState::ParsingInput;
        }
        self.shared
            .notifications
            .publish(TranscodeNotification::State(TranscodeState::ParsingInput));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let shared = self.shared.clone();
        let path = path.as_ref().to_path_buf();
        self.pool.spawn(move || {
            let parsed = shared.library.open_input(&path).map(|demuxer| demuxer.media_info(&path));
            match &parsed {
                Ok(info) => {
                    tracing::info!("Parsed {}: {} streams, {}us", path.display(), info.streams.len(), info.duration_us);
                    *shared.input.lock() = Some(info.clone());
                    shared.notifications.publish(TranscodeNotification::MediaTrack(info.clone()));
                    shared.set_state(TranscodeState::Ready);
                }
                Err(e) => {
                    shared.report(e);
                    *shared.input.lock() = None;
                    shared.set_state(TranscodeState::Idle);
                }
            }
            let _ = tx.send(parsed);
        });
        Ok(rx)
    }

    /// Start transcoding the parsed input into `output`.
    pub fn start(&mut self, output: impl AsRef<Path>, encode: EncodeContext) -> Result<()> {
        let input = {
            let mut state = self.shared.state.lock();
            if *state != TranscodeState::Ready {
                return Err(MediaError::InvalidState(format!("cannot start while {:?}", *state)));
            }
            let Some(info) = self.shared.input.lock().clone() else {
                return Err(MediaError::InvalidState("no parsed input".into()));
            };
            *state = TranscodeState::Running;
            info.path
        };
        self.shared
            .notifications
            .publish(TranscodeNotification::State(TranscodeState::Running));
        self.shared.stop.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let output = output.as_ref().to_path_buf();
        let spawned = thread::Builder::new()
            .name("kino-transcode".into())
            .spawn(move || run_job(&shared, &input, &output, &encode));
        match spawned {
            Ok(handle) => {
                self.job = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(TranscodeState::Ready);
                Err(e.into())
            }
        }
    }

    /// Ask the running job to stop after the current packet. The output is
    /// still finalized.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state() == TranscodeState::Running
    }

    /// Join the running job and return to Idle.
    pub fn wait(&mut self) -> Result<TranscodeReport> {
        let Some(job) = self.job.take() else {
            return Err(MediaError::InvalidState("no transcode job".into()));
        };
        let result = job
            .join()
            .map_err(|_| MediaError::InvalidState("transcode thread panicked".into()))
            .and_then(|r| r);
        self.shared.set_state(TranscodeState::Idle);
        result
    }

    /// Extract `count` previews on the worker pool. Safe to call while a
    /// transcode of the same file is running.
    pub fn preview(&self, path: impl AsRef<Path>, count: usize) -> Receiver<Result<Vec<PreviewImage>>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let library = self.shared.library.clone();
        let path: PathBuf = path.as_ref().to_path_buf();
        self.pool.spawn(move || {
            let _ = tx.send(generate_previews(library.as_ref(), &path, count));
        });
        rx
    }

    /// Parse, run and wait in one blocking call.
    pub fn transcode(
        &mut self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        encode: EncodeContext,
    ) -> Result<TranscodeReport> {
        let parsed = self.parse_input(input)?;
        parsed
            .recv()
            .map_err(|_| MediaError::InvalidState("input parser went away".into()))??;
        self.start(output, encode)?;
        self.wait()
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        self.stop();
        if let Some(job) = self.job.take() {
            let _ = job.join();
        }
    }
}

fn run_job(shared: &TranscoderShared, input: &Path, output: &Path, encode: &EncodeContext) -> Result<TranscodeReport> {
    let run = Run {
        library: shared.library.as_ref(),
        config: &shared.config.transcode,
        notifications: &shared.notifications,
        stop: &shared.stop,
    };
    match run.execute(input, output, encode) {
        Ok(outcome) => {
            let state = if outcome.stopped {
                TranscodeState::Stopped
            } else {
                TranscodeState::Finished
            };
            shared
                .notifications
                .publish(TranscodeNotification::Progress(outcome.stats.clone()));
            shared.set_state(state);
            Ok(TranscodeReport {
                state,
                stats: outcome.stats,
            })
        }
        Err(e) => {
            shared.report(&e);
            shared.set_state(TranscodeState::Stopped);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{
        CodecError, CodecResult, Demuxer, EncoderSettings, FilterGraph, FilterSpec, FrameDecoder, FrameEncoder,
        HwDevice, Muxer, SeekDirection,
    };
    use crate::hwaccel::HwDeviceKind;
    use crate::media::{
        AudioFormat, ChannelLayout, Chapter, MediaType, Packet, PixelFormat, Rational, SampleFormat, StreamInfo,
        VideoFormat,
    };
    use crate::raw::{generate, KrawDemuxer, RawLibrary, RawOptions, SynthAudio, SynthSpec, SynthVideo};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn synth_file(dir: &Path, duration_us: i64) -> PathBuf {
        let path = dir.join("in.kraw");
        generate(
            &path,
            &SynthSpec {
                duration_us,
                video: Some(SynthVideo {
                    format: VideoFormat::new(PixelFormat::Gray8, 4, 4),
                    frame_rate: Rational::new(25, 1),
                    gop: 5,
                }),
                audio: vec![SynthAudio {
                    format: AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000),
                    samples_per_packet: 512,
                }],
                subtitles: vec![(0, 100_000, "hi".into())],
                title: Some("in".into()),
            },
        )
        .unwrap();
        path
    }

    /// Packets per stream and whether pts rose monotonically within each.
    fn read_back(path: &Path) -> (Vec<StreamInfo>, Vec<u64>, bool) {
        let mut demuxer = KrawDemuxer::open(path).unwrap();
        let streams = demuxer.streams().to_vec();
        let mut counts = vec![0u64; streams.len()];
        let mut last: Vec<Option<i64>> = vec![None; streams.len()];
        let mut monotonic = true;
        while let Ok(packet) = demuxer.read_packet() {
            counts[packet.stream_index] += 1;
            if let Some(prev) = last[packet.stream_index] {
                monotonic &= packet.pts > prev;
            }
            last[packet.stream_index] = Some(packet.pts);
        }
        (streams, counts, monotonic)
    }

    fn errors(rx: &Receiver<TranscodeNotification>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|n| match n {
                TranscodeNotification::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_round_trip_flushes_delayed_packets() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 400_000);
        let output = dir.path().join("out.kraw");

        let mut encode = EncodeContext::default();
        encode.video.options.insert("lookahead".into(), "2".into());
        encode.audio.codec = Some("pcm_f32le".into());
        encode.audio.frame_size = Some(256);
        encode.subtitle = StreamEncode::copy();

        let mut transcoder = Transcoder::new(EngineConfig::default(), Arc::new(RawLibrary::default())).unwrap();
        let report = transcoder.transcode(&input, &output, encode).unwrap();
        assert_eq!(report.state, TranscodeState::Finished);
        assert_eq!(transcoder.state(), TranscodeState::Idle);
        assert_eq!(report.stats.progress(), 100.0);

        let (streams, counts, monotonic) = read_back(&output);
        assert_eq!(streams.len(), 3);
        assert_eq!(streams[1].codec, "pcm_f32le");
        // 10 pictures; 3200 samples as 12 full frames and one short one.
        assert_eq!(counts, vec![10, 13, 1]);
        assert!(monotonic);
        assert_eq!(report.stats.packets_written.get(&0), Some(&10));
        assert_eq!(report.stats.total_packets_written(), 24);
    }

    #[test]
    fn test_streams_can_be_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 200_000);
        let output = dir.path().join("audio.kraw");

        let encode = EncodeContext {
            video: StreamEncode::disabled(),
            subtitle: StreamEncode::disabled(),
            ..EncodeContext::default()
        };
        let mut transcoder = Transcoder::new(EngineConfig::default(), Arc::new(RawLibrary::default())).unwrap();
        let report = transcoder.transcode(&input, &output, encode).unwrap();
        assert_eq!(report.state, TranscodeState::Finished);

        let (streams, counts, _) = read_back(&output);
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].media_type, MediaType::Audio);
        assert_eq!(counts, vec![4]);
    }

    #[test]
    fn test_hardware_transfer_failure_fails_one_stream() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 400_000);
        let output = dir.path().join("out.kraw");
        let library = RawLibrary::new(RawOptions {
            fail_downloads: true,
            ..RawOptions::default()
        });

        let encode = EncodeContext {
            gpu_decode: true,
            ..EncodeContext::default()
        };
        let mut transcoder = Transcoder::new(EngineConfig::default(), Arc::new(library)).unwrap();
        let rx = transcoder.notifications();
        let report = transcoder.transcode(&input, &output, encode).unwrap();
        assert_eq!(report.state, TranscodeState::Finished);

        let (_, counts, _) = read_back(&output);
        assert_eq!(counts, vec![0, 7, 1]);
        let errors = errors(&rx);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Hardware transfer failed on stream 0"));
    }

    #[test]
    fn test_start_requires_parsed_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcoder = Transcoder::new(EngineConfig::default(), Arc::new(RawLibrary::default())).unwrap();
        let err = transcoder
            .start(dir.path().join("out.kraw"), EncodeContext::default())
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
        assert!(matches!(transcoder.wait(), Err(MediaError::InvalidState(_))));
    }

    #[test]
    fn test_parse_failure_returns_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new(EngineConfig::default(), Arc::new(RawLibrary::default())).unwrap();
        let rx = transcoder.notifications();
        let parsed = transcoder.parse_input(dir.path().join("missing.kraw")).unwrap();
        assert!(parsed.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
        assert_eq!(transcoder.state(), TranscodeState::Idle);
        assert_eq!(errors(&rx).len(), 1);
    }

    /// Demuxer that runs dry after a few packets without ever ending.
    struct DryDemuxer {
        inner: Box<dyn Demuxer>,
        remaining: usize,
    }

    impl Demuxer for DryDemuxer {
        fn format_name(&self) -> &str {
            self.inner.format_name()
        }

        fn streams(&self) -> &[StreamInfo] {
            self.inner.streams()
        }

        fn duration_us(&self) -> i64 {
            self.inner.duration_us()
        }

        fn metadata(&self) -> &BTreeMap<String, String> {
            self.inner.metadata()
        }

        fn chapters(&self) -> &[Chapter] {
            self.inner.chapters()
        }

        fn read_packet(&mut self) -> CodecResult<Packet> {
            if self.remaining == 0 {
                return Err(CodecError::Again);
            }
            self.remaining -= 1;
            self.inner.read_packet()
        }

        fn seek(&mut self, position_us: i64, direction: SeekDirection) -> CodecResult<()> {
            self.inner.seek(position_us, direction)
        }
    }

    struct DryLibrary(RawLibrary);

    impl CodecLibrary for DryLibrary {
        fn name(&self) -> &str {
            "dry"
        }

        fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>> {
            Ok(Box::new(DryDemuxer {
                inner: self.0.open_input(path)?,
                remaining: 8,
            }))
        }

        fn open_output(&self, path: &Path) -> Result<Box<dyn Muxer>> {
            self.0.open_output(path)
        }

        fn create_decoder(&self, stream: &StreamInfo, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameDecoder>> {
            self.0.create_decoder(stream, hw)
        }

        fn create_encoder(&self, settings: &EncoderSettings, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameEncoder>> {
            self.0.create_encoder(settings, hw)
        }

        fn create_filter_graph(&self, spec: &FilterSpec) -> Result<Box<dyn FilterGraph>> {
            self.0.create_filter_graph(spec)
        }

        fn create_hw_device(&self, kind: HwDeviceKind) -> Result<Arc<dyn HwDevice>> {
            self.0.create_hw_device(kind)
        }
    }

    #[test]
    fn test_stop_finalizes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 2_000_000);
        let output = dir.path().join("out.kraw");

        let mut transcoder = Transcoder::new(EngineConfig::default(), Arc::new(DryLibrary(RawLibrary::default()))).unwrap();
        let rx = transcoder.notifications();
        let parsed = transcoder.parse_input(&input).unwrap();
        parsed.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(transcoder.state(), TranscodeState::Ready);

        transcoder.start(&output, EncodeContext::default()).unwrap();
        assert!(transcoder.is_running());
        std::thread::sleep(Duration::from_millis(100));
        transcoder.stop();
        let report = transcoder.wait().unwrap();
        assert_eq!(report.state, TranscodeState::Stopped);
        assert_eq!(report.stats.packets_read, 8);

        let (streams, counts, _) = read_back(&output);
        assert_eq!(streams.len(), 3);
        assert_eq!(counts.iter().sum::<u64>(), 8);

        let states: Vec<TranscodeState> = rx
            .try_iter()
            .filter_map(|n| match n {
                TranscodeNotification::State(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                TranscodeState::ParsingInput,
                TranscodeState::Ready,
                TranscodeState::Running,
                TranscodeState::Stopped,
                TranscodeState::Idle,
            ]
        );
    }

    #[test]
    fn test_preview_gives_up_on_dry_demuxer() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 2_000_000);
        let transcoder = Transcoder::new(EngineConfig::default(), Arc::new(DryLibrary(RawLibrary::default()))).unwrap();

        let previews = transcoder
            .preview(&input, 20)
            .recv_timeout(Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert_eq!(previews.len(), 20);
        assert!(!previews[0].substituted);
        assert!(previews.iter().any(|p| p.substituted));
        for (i, preview) in previews.iter().enumerate() {
            assert_eq!(preview.index, i);
        }
        // A stand-in repeats the last real picture before it.
        let last = previews.iter().rposition(|p| !p.substituted).unwrap();
        assert!(previews[last + 1..].iter().all(|p| p.pts_us == previews[last].pts_us));

        // The pool is free again for the next task.
        let info = transcoder
            .parse_input(&input)
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(info.streams.len(), 3);
    }

    #[test]
    fn test_preview_runs_on_pool() {
        let dir = tempfile::tempdir().unwrap();
        let input = synth_file(dir.path(), 1_000_000);
        let transcoder = Transcoder::new(EngineConfig::default(), Arc::new(RawLibrary::default())).unwrap();
        let previews = transcoder
            .preview(&input, 5)
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(previews.len(), 5);
        assert!(previews.windows(2).all(|w| w[0].pts_us < w[1].pts_us));
    }
}
