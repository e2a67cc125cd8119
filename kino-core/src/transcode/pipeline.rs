//! # Transcode Run
//!
//! One blocking pass over an input file:
//!
//! ```text
//! open input/output ─► map streams ─► header ─► packet loop ─► flush streams ─► trailer
//! ```
//!
//! A stream that fails (decode, filter, encode or hardware transfer) is
//! invalidated and its siblings carry on. Failing to open either file, or
//! to write the output, aborts the run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{CodecError, CodecLibrary, HwDevice, Muxer};
use crate::config::TranscodeConfig;
use crate::error::{recorder, MediaError, Result};
use crate::event::NotificationQueue;
use crate::hwaccel;
use crate::media::{MediaInfo, MediaType};

use super::context::{EncodeContext, StreamMode, TranscoderContext};
use super::progress::{ProgressTracker, TranscodeStats};
use super::TranscodeNotification;

/// Back-off when the demuxer has no data yet.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

pub(crate) struct RunOutcome {
    pub stats: TranscodeStats,
    pub stopped: bool,
}

pub(crate) struct Run<'a> {
    pub library: &'a dyn CodecLibrary,
    pub config: &'a TranscodeConfig,
    pub notifications: &'a NotificationQueue<TranscodeNotification>,
    pub stop: &'a AtomicBool,
}

impl Run<'_> {
    fn report(&self, error: &MediaError) {
        let message = recorder().record(error);
        self.notifications.publish(TranscodeNotification::Error(message));
    }

    pub fn execute(&self, input: &Path, output: &Path, encode: &EncodeContext) -> Result<RunOutcome> {
        let mut demuxer = self.library.open_input(input)?;
        let info = demuxer.media_info(input);
        let mut muxer = self.library.open_output(output)?;
        tracing::info!("Transcoding {} -> {}", input.display(), output.display());

        let (mut contexts, routes) = self.map_streams(&info, encode, muxer.as_mut())?;
        if contexts.is_empty() {
            return Err(MediaError::InvalidState(format!(
                "no output streams mapped from {}",
                input.display()
            )));
        }

        muxer.set_metadata(info.metadata.clone());
        muxer.set_chapters(info.chapters.clone());
        muxer.write_header()?;

        let mut tracker = ProgressTracker::new(info.duration_us, Duration::from_millis(self.config.progress_interval_ms));
        let mut stopped = false;

        loop {
            if self.stop.load(Ordering::Acquire) {
                tracing::info!("Transcode stop requested");
                stopped = true;
                break;
            }

            let packet = match demuxer.read_packet() {
                Ok(packet) => packet,
                Err(CodecError::Again) => {
                    std::thread::sleep(IDLE_SLEEP);
                    continue;
                }
                Err(CodecError::EndOfStream) => break,
                Err(CodecError::Fatal(reason)) => {
                    self.report(&MediaError::open(input, format!("read failed: {}", reason)));
                    break;
                }
            };

            let Some(&slot) = routes.get(&packet.stream_index) else {
                continue;
            };
            tracker.advance(packet.pts_us());

            let ctx = &mut contexts[slot];
            if let Err(e) = ctx.process_packet(packet, muxer.as_mut(), self.library) {
                if e.is_fatal_to_session() {
                    return Err(e);
                }
                self.report(&e);
                ctx.invalidate();
            }

            if tracker.due() {
                tracker.update(contexts.iter().map(|c| (c.output_index(), c.stats())));
                self.notifications
                    .publish(TranscodeNotification::Progress(tracker.stats().clone()));
            }
        }

        for ctx in contexts.iter_mut().filter(|c| c.is_valid()) {
            if let Err(e) = ctx.finish(muxer.as_mut(), self.library) {
                if e.is_fatal_to_session() {
                    return Err(e);
                }
                self.report(&e);
                ctx.invalidate();
            }
        }
        muxer.write_trailer()?;

        tracker.update(contexts.iter().map(|c| (c.output_index(), c.stats())));
        if !stopped {
            tracker.advance(info.duration_us);
        }
        let stats = tracker.into_stats();
        tracing::info!(
            "Transcode {}: {} packets read, {} frames encoded, {} packets written",
            if stopped { "stopped" } else { "finished" },
            stats.packets_read,
            stats.frames_encoded,
            stats.total_packets_written()
        );
        Ok(RunOutcome { stats, stopped })
    }

    /// Build one context per mapped input stream, registering each with the
    /// muxer in input order. Returns the contexts and an input-index route map.
    fn map_streams(
        &self,
        info: &MediaInfo,
        encode: &EncodeContext,
        muxer: &mut dyn Muxer,
    ) -> Result<(Vec<TranscoderContext>, HashMap<usize, usize>)> {
        let device: Option<Arc<dyn HwDevice>> = if encode.uses_gpu() {
            hwaccel::open_device(self.library, encode.hw_device)
        } else {
            None
        };
        if encode.uses_gpu() && device.is_none() {
            tracing::warn!("GPU path requested but no device could be opened, using software");
        }

        let mut contexts = Vec::new();
        let mut routes = HashMap::new();
        for stream in &info.streams {
            let mut ctx = match encode.mode_for(stream) {
                StreamMode::Skip => {
                    tracing::debug!("stream {} ({}) not mapped", stream.index, stream.media_type.label());
                    continue;
                }
                StreamMode::Copy => TranscoderContext::copy(stream),
                StreamMode::Encode(params) => {
                    let video = stream.media_type == MediaType::Video;
                    let decode_device = device.clone().filter(|_| video && encode.gpu_decode);
                    let encode_device = device.clone().filter(|_| video && encode.gpu_encode);
                    match TranscoderContext::open(
                        self.library,
                        stream,
                        &params,
                        contexts.len(),
                        decode_device,
                        encode_device,
                    ) {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            self.report(&e);
                            continue;
                        }
                    }
                }
            };

            let index = muxer.add_stream(ctx.output_stream().clone())?;
            ctx.set_output_index(index);
            routes.insert(stream.index, contexts.len());
            contexts.push(ctx);
        }
        Ok((contexts, routes))
    }
}
