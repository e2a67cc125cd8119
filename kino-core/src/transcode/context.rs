//! Per-run encode parameters and the per-stream transcode chain.
//!
//! ```text
//! packet ─► decoder ─► to_host ─► filter (lazy) ─► audio FIFO ─► to_device ─► encoder ─► muxer
//!   │                                                                                   ▲
//!   └──────────────────────────── copy: rescale only ───────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio_fifo::AudioFifo;
use crate::codec::{
    decode_error, encode_error, or_empty, CodecError, CodecLibrary, EncoderSettings, FilterGraph, FilterSpec,
    FrameDecoder, FrameEncoder, HwDevice, Muxer,
};
use crate::error::{MediaError, Result};
use crate::hwaccel::{self, HwDeviceKind};
use crate::media::{
    ChannelLayout, Frame, FrameFormat, MediaType, Packet, PixelFormat, Rational, SampleFormat, StreamInfo,
};

/// Codec name that requests passthrough.
pub const COPY: &str = "copy";

// ============================================================================
// Encode Parameters
// ============================================================================

/// Parameters for one kind of output stream. Unset fields follow the input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEncode {
    /// Target codec, [`COPY`] for passthrough, `None` to keep the input codec.
    pub codec: Option<String>,
    /// Leave the stream out of the output.
    pub disabled: bool,
    pub bit_rate: Option<u64>,
    pub profile: Option<String>,
    pub preset: Option<String>,
    pub crf: Option<u8>,
    pub size: Option<(u32, u32)>,
    pub pixel_format: Option<PixelFormat>,
    pub sample_rate: Option<u32>,
    pub sample_format: Option<SampleFormat>,
    pub channel_layout: Option<ChannelLayout>,
    /// Fixed samples per encoded audio frame.
    pub frame_size: Option<usize>,
    /// Filter chain run before the encoder, e.g. `scale=320:240`.
    pub filter: Option<String>,
    /// Codec private options.
    pub options: BTreeMap<String, String>,
}

impl StreamEncode {
    pub fn copy() -> Self {
        Self {
            codec: Some(COPY.into()),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn is_copy(&self) -> bool {
        self.codec.as_deref() == Some(COPY)
    }
}

/// Encode parameters of one transcode run. Immutable while it runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeContext {
    pub video: StreamEncode,
    pub audio: StreamEncode,
    pub subtitle: StreamEncode,
    /// Replaces the per-type parameters for the keyed input stream.
    pub overrides: BTreeMap<usize, StreamEncode>,
    pub gpu_decode: bool,
    pub gpu_encode: bool,
    /// Device kind to try first when a GPU path is requested.
    pub hw_device: Option<HwDeviceKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMode {
    Skip,
    Copy,
    Encode(StreamEncode),
}

impl EncodeContext {
    pub fn params_for(&self, stream: &StreamInfo) -> Option<&StreamEncode> {
        if let Some(params) = self.overrides.get(&stream.index) {
            return Some(params);
        }
        match stream.media_type {
            MediaType::Video => Some(&self.video),
            MediaType::Audio => Some(&self.audio),
            MediaType::Subtitle => Some(&self.subtitle),
            MediaType::Data => None,
        }
    }

    pub fn mode_for(&self, stream: &StreamInfo) -> StreamMode {
        match self.params_for(stream) {
            None => StreamMode::Skip,
            Some(params) if params.disabled => StreamMode::Skip,
            Some(params) if params.is_copy() => StreamMode::Copy,
            Some(params) => StreamMode::Encode(params.clone()),
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu_decode || self.gpu_encode
    }
}

/// Resolve encoder settings for `stream`, writing output stream `output_index`.
pub fn encoder_settings(stream: &StreamInfo, params: &StreamEncode, output_index: usize) -> EncoderSettings {
    let codec = params.codec.clone().unwrap_or_else(|| stream.codec.clone());
    let mut settings = EncoderSettings::new(output_index, stream.media_type, codec, stream.time_base);
    settings.bit_rate = params.bit_rate;
    settings.profile = params.profile.clone();
    settings.preset = params.preset.clone();
    settings.crf = params.crf;
    settings.options = params.options.clone();

    match stream.media_type {
        MediaType::Video => {
            settings.video = stream.video.map(|mut video| {
                if let Some((width, height)) = params.size {
                    video.width = width;
                    video.height = height;
                }
                if let Some(pixel_format) = params.pixel_format {
                    video.pixel_format = pixel_format;
                }
                video
            });
            settings.frame_rate = stream.frame_rate;
        }
        MediaType::Audio => {
            settings.audio = stream.audio.map(|mut audio| {
                if let Some(rate) = params.sample_rate {
                    audio.sample_rate = rate;
                }
                if let Some(format) = params.sample_format {
                    audio.sample_format = format;
                }
                if let Some(layout) = params.channel_layout {
                    audio.layout = layout;
                }
                audio
            });
            if let Some(audio) = settings.audio {
                settings.time_base = audio.time_base();
            }
            settings.frame_size = params.frame_size;
        }
        _ => {}
    }
    settings
}

// ============================================================================
// Per-Stream Chain
// ============================================================================

/// Counters of one mapped stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub packets_read: u64,
    pub frames_decoded: u64,
    pub frames_encoded: u64,
    pub packets_written: u64,
}

struct EncodePath {
    decoder: Box<dyn FrameDecoder>,
    decode_device: Option<Arc<dyn HwDevice>>,
    filter_description: String,
    /// Built from the first decoded frame.
    filter: Option<Box<dyn FilterGraph>>,
    fifo: Option<AudioFifo>,
    encoder: Box<dyn FrameEncoder>,
    encode_device: Option<Arc<dyn HwDevice>>,
    target: Option<FrameFormat>,
}

enum Chain {
    Copy,
    Encode(Box<EncodePath>),
}

/// Decode, filter, re-frame and encode one input stream into one output stream.
pub struct TranscoderContext {
    input: StreamInfo,
    output: StreamInfo,
    chain: Chain,
    valid: bool,
    stats: StreamStats,
}

impl TranscoderContext {
    /// Passthrough: packets are only re-indexed and rescaled by the muxer.
    pub fn copy(input: &StreamInfo) -> Self {
        Self {
            input: input.clone(),
            output: input.clone(),
            chain: Chain::Copy,
            valid: true,
            stats: StreamStats::default(),
        }
    }

    /// `encode_device` must be set when `encoder` takes device frames.
    pub fn encode(
        input: &StreamInfo,
        decoder: Box<dyn FrameDecoder>,
        decode_device: Option<Arc<dyn HwDevice>>,
        encoder: Box<dyn FrameEncoder>,
        encode_device: Option<Arc<dyn HwDevice>>,
        filter_description: Option<String>,
    ) -> Self {
        let output = encoder.output_stream();
        let target = output.frame_format();
        let fifo = match (encoder.frame_size(), output.audio) {
            (Some(_), Some(format)) => Some(AudioFifo::new(format)),
            _ => None,
        };
        let filter_description = filter_description.unwrap_or_else(|| match input.media_type {
            MediaType::Audio => "anull".into(),
            _ => "null".into(),
        });

        Self {
            input: input.clone(),
            output,
            chain: Chain::Encode(Box::new(EncodePath {
                decoder,
                decode_device,
                filter_description,
                filter: None,
                fifo,
                encoder,
                encode_device,
                target,
            })),
            valid: true,
            stats: StreamStats::default(),
        }
    }

    /// Open decoder and encoder for `stream`, on the GPU where requested and
    /// possible, in software otherwise.
    pub fn open(
        library: &dyn CodecLibrary,
        stream: &StreamInfo,
        params: &StreamEncode,
        output_index: usize,
        decode_device: Option<Arc<dyn HwDevice>>,
        encode_device: Option<Arc<dyn HwDevice>>,
    ) -> Result<Self> {
        let (decoder, decode_device) = match decode_device {
            Some(device) => match library.create_decoder(stream, Some(device.clone())) {
                Ok(decoder) => (decoder, Some(device)),
                Err(e) => {
                    tracing::warn!("stream {}: hardware decoder unavailable ({}), using software", stream.index, e);
                    (library.create_decoder(stream, None)?, None)
                }
            },
            None => (library.create_decoder(stream, None)?, None),
        };

        let settings = encoder_settings(stream, params, output_index);
        let (encoder, encode_device) = match encode_device {
            Some(device) => match library.create_encoder(&settings, Some(device.clone())) {
                Ok(encoder) => (encoder, Some(device)),
                Err(e) => {
                    tracing::warn!("stream {}: hardware encoder unavailable ({}), using software", stream.index, e);
                    (library.create_encoder(&settings, None)?, None)
                }
            },
            None => (library.create_encoder(&settings, None)?, None),
        };
        tracing::info!(
            "stream {}: {} -> {} ({} / {})",
            stream.index,
            stream.codec,
            settings.codec,
            decoder.name(),
            encoder.name()
        );

        Ok(Self::encode(
            stream,
            decoder,
            decode_device,
            encoder,
            encode_device,
            params.filter.clone(),
        ))
    }

    pub fn input(&self) -> &StreamInfo {
        &self.input
    }

    /// Stream to register with the muxer.
    pub fn output_stream(&self) -> &StreamInfo {
        &self.output
    }

    pub fn output_index(&self) -> usize {
        self.output.index
    }

    /// Record the index the muxer assigned.
    pub fn set_output_index(&mut self, index: usize) {
        self.output.index = index;
    }

    pub fn is_copy(&self) -> bool {
        matches!(self.chain, Chain::Copy)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Stop feeding this stream; siblings carry on.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    pub fn process_packet(&mut self, mut packet: Packet, muxer: &mut dyn Muxer, library: &dyn CodecLibrary) -> Result<()> {
        if !self.valid {
            return Ok(());
        }
        self.stats.packets_read += 1;

        if let Chain::Copy = self.chain {
            return self.write(packet, muxer);
        }

        if !packet.time_base.is_valid() {
            packet.time_base = self.input.time_base;
        }
        packet.rescale_ts(self.decoder_time_base());

        let frames = match &mut self.chain {
            Chain::Encode(path) => path.decoder.decode(&packet),
            Chain::Copy => Ok(Vec::new()),
        };
        let frames = match or_empty(frames) {
            Ok(frames) => frames,
            Err(CodecError::EndOfStream) => Vec::new(),
            Err(e) => return Err(decode_error(self.input.index, e)),
        };
        for frame in frames {
            self.stats.frames_decoded += 1;
            self.filter_frame(Some(frame), muxer, library)?;
        }
        Ok(())
    }

    /// Flush every stage in order: decoder, filter graph, audio FIFO, encoder.
    pub fn finish(&mut self, muxer: &mut dyn Muxer, library: &dyn CodecLibrary) -> Result<()> {
        if !self.valid || self.is_copy() {
            return Ok(());
        }

        let drained = match &mut self.chain {
            Chain::Encode(path) => path.decoder.drain(),
            Chain::Copy => Ok(Vec::new()),
        };
        match or_empty(drained) {
            Ok(frames) => {
                for frame in frames {
                    self.stats.frames_decoded += 1;
                    self.filter_frame(Some(frame), muxer, library)?;
                }
            }
            Err(CodecError::EndOfStream) => {}
            Err(e) => return Err(decode_error(self.input.index, e)),
        }

        self.filter_frame(None, muxer, library)?;

        let short = match &mut self.chain {
            Chain::Encode(path) => path.fifo.as_mut().and_then(AudioFifo::flush_frame),
            Chain::Copy => None,
        };
        if let Some(frame) = short {
            self.send(Some(frame), muxer)?;
        }

        loop {
            let packets = match &mut self.chain {
                Chain::Encode(path) => path.encoder.encode(None),
                Chain::Copy => Err(CodecError::EndOfStream),
            };
            match packets {
                Ok(packets) if packets.is_empty() => break,
                Ok(packets) => {
                    for packet in packets {
                        self.write(packet, muxer)?;
                    }
                }
                Err(CodecError::Again) | Err(CodecError::EndOfStream) => break,
                Err(e) => return Err(encode_error(self.output.index, e)),
            }
        }
        tracing::debug!(
            "stream {}: flushed ({} frames encoded, {} packets written)",
            self.input.index,
            self.stats.frames_encoded,
            self.stats.packets_written
        );
        Ok(())
    }

    fn decoder_time_base(&self) -> Rational {
        match &self.chain {
            Chain::Encode(path) if path.decoder.time_base().is_valid() => path.decoder.time_base(),
            _ => self.input.time_base,
        }
    }

    /// Filter one frame, or flush the graph with `None`.
    fn filter_frame(&mut self, frame: Option<Frame>, muxer: &mut dyn Muxer, library: &dyn CodecLibrary) -> Result<()> {
        let stream = self.input.index;
        let Chain::Encode(path) = &mut self.chain else {
            return Ok(());
        };

        let frame = match frame {
            Some(frame) => Some(hwaccel::to_host(stream, path.decode_device.as_ref(), frame)?),
            None => None,
        };

        if path.filter.is_none() {
            let Some(first) = &frame else {
                // Nothing was ever decoded, so there is nothing to flush.
                return Ok(());
            };
            let spec = FilterSpec {
                stream_index: stream,
                description: path.filter_description.clone(),
                input: first.format,
                time_base: first.time_base,
                target: path.target,
            };
            path.filter = Some(library.create_filter_graph(&spec)?);
        }
        let Some(filter) = path.filter.as_mut() else {
            return Ok(());
        };

        let filtered = match or_empty(filter.push(frame)) {
            Ok(frames) => frames,
            Err(CodecError::EndOfStream) => Vec::new(),
            Err(e) => {
                return Err(MediaError::Filter {
                    stream,
                    reason: e.to_string(),
                })
            }
        };
        for frame in filtered {
            self.encode_frame(frame, muxer)?;
        }
        Ok(())
    }

    /// Route through the FIFO when the encoder wants fixed-size frames.
    fn encode_frame(&mut self, frame: Frame, muxer: &mut dyn Muxer) -> Result<()> {
        let Chain::Encode(path) = &mut self.chain else {
            return Ok(());
        };
        let Some(frame_size) = path.encoder.frame_size() else {
            return self.send(Some(frame), muxer);
        };
        let Some(fifo) = path.fifo.as_mut() else {
            return self.send(Some(frame), muxer);
        };

        fifo.write_frame(&frame);
        let mut ready = Vec::new();
        while let Some(frame) = fifo.read_frame(frame_size) {
            ready.push(frame);
        }
        for frame in ready {
            self.send(Some(frame), muxer)?;
        }
        Ok(())
    }

    fn send(&mut self, frame: Option<Frame>, muxer: &mut dyn Muxer) -> Result<()> {
        let output = self.output.index;
        let Chain::Encode(path) = &mut self.chain else {
            return Ok(());
        };

        let frame = match (frame, &path.encode_device) {
            (Some(frame), Some(device)) => Some(hwaccel::to_device(output, device, frame)?),
            (frame, _) => frame,
        };
        if frame.is_some() {
            self.stats.frames_encoded += 1;
        }

        let packets = match or_empty(path.encoder.encode(frame.as_ref())) {
            Ok(packets) => packets,
            Err(CodecError::EndOfStream) => Vec::new(),
            Err(e) => return Err(encode_error(output, e)),
        };
        for packet in packets {
            self.write(packet, muxer)?;
        }
        Ok(())
    }

    fn write(&mut self, mut packet: Packet, muxer: &mut dyn Muxer) -> Result<()> {
        packet.stream_index = self.output.index;
        muxer.write_interleaved(packet)?;
        self.stats.packets_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecResult;
    use crate::media::{AudioFormat, VideoFormat};
    use crate::raw::RawLibrary;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Collects written packets.
    #[derive(Default)]
    struct VecMuxer {
        packets: Vec<Packet>,
    }

    impl Muxer for VecMuxer {
        fn add_stream(&mut self, _info: StreamInfo) -> Result<usize> {
            Ok(0)
        }

        fn write_header(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_interleaved(&mut self, packet: Packet) -> Result<()> {
            self.packets.push(packet);
            Ok(())
        }

        fn write_trailer(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Fixed-frame-size encoder that counts the frames it is given.
    struct CountingEncoder {
        format: AudioFormat,
        frame_size: usize,
        calls: Arc<AtomicUsize>,
    }

    impl FrameEncoder for CountingEncoder {
        fn name(&self) -> &str {
            "counting"
        }

        fn encode(&mut self, frame: Option<&Frame>) -> CodecResult<Vec<Packet>> {
            let Some(frame) = frame else {
                return Err(CodecError::EndOfStream);
            };
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = frame.data().cloned().unwrap_or_default();
            Ok(vec![Packet::new(0, frame.pts, frame.nb_samples() as i64, self.format.time_base(), data)])
        }

        fn frame_size(&self) -> Option<usize> {
            Some(self.frame_size)
        }

        fn time_base(&self) -> Rational {
            self.format.time_base()
        }

        fn output_stream(&self) -> StreamInfo {
            StreamInfo::audio(0, "pcm_s16le", self.format)
        }
    }

    fn mono() -> AudioFormat {
        AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000)
    }

    fn audio_packet(n: i64, samples: usize) -> Packet {
        let tb = mono().time_base();
        Packet::new(0, n * samples as i64, samples as i64, tb, Bytes::from(vec![0u8; samples * 2])).with_key_frame(true)
    }

    #[test]
    fn test_fifo_reframes_to_encoder_frame_size() {
        let library = RawLibrary::default();
        let stream = StreamInfo::audio(0, "pcm_s16le", mono());
        let calls = Arc::new(AtomicUsize::new(0));
        let encoder = CountingEncoder {
            format: mono(),
            frame_size: 1024,
            calls: calls.clone(),
        };
        let decoder = library.create_decoder(&stream, None).unwrap();
        let mut ctx = TranscoderContext::encode(&stream, decoder, None, Box::new(encoder), None, None);

        let mut muxer = VecMuxer::default();
        for n in 0..20 {
            ctx.process_packet(audio_packet(n, 512), &mut muxer, &library).unwrap();
        }
        ctx.finish(&mut muxer, &library).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(ctx.stats().frames_decoded, 20);
        assert_eq!(ctx.stats().frames_encoded, 10);
        assert_eq!(muxer.packets.len(), 10);
        let pts: Vec<i64> = muxer.packets.iter().map(|p| p.pts).collect();
        assert_eq!(pts, (0..10).map(|i| i * 1024).collect::<Vec<_>>());
    }

    #[test]
    fn test_final_short_frame_on_finish() {
        let library = RawLibrary::default();
        let stream = StreamInfo::audio(0, "pcm_s16le", mono());
        let calls = Arc::new(AtomicUsize::new(0));
        let encoder = CountingEncoder {
            format: mono(),
            frame_size: 1024,
            calls: calls.clone(),
        };
        let decoder = library.create_decoder(&stream, None).unwrap();
        let mut ctx = TranscoderContext::encode(&stream, decoder, None, Box::new(encoder), None, None);

        let mut muxer = VecMuxer::default();
        for n in 0..3 {
            ctx.process_packet(audio_packet(n, 512), &mut muxer, &library).unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        ctx.finish(&mut muxer, &library).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(muxer.packets[1].duration, 512);
    }

    #[test]
    fn test_mode_resolution() {
        let video = StreamInfo::video(0, "rawvideo", VideoFormat::new(PixelFormat::Gray8, 4, 4), Rational::new(25, 1));
        let audio = StreamInfo::audio(1, "pcm_s16le", mono());
        let data = StreamInfo::new(2, MediaType::Data, "bin", Rational::new(1, 1000));

        let mut ctx = EncodeContext {
            video: StreamEncode::copy(),
            ..EncodeContext::default()
        };
        assert_eq!(ctx.mode_for(&video), StreamMode::Copy);
        assert!(matches!(ctx.mode_for(&audio), StreamMode::Encode(_)));
        assert_eq!(ctx.mode_for(&data), StreamMode::Skip);

        ctx.overrides.insert(1, StreamEncode::disabled());
        assert_eq!(ctx.mode_for(&audio), StreamMode::Skip);
    }

    #[test]
    fn test_encoder_settings_follow_input() {
        let audio = StreamInfo::audio(3, "pcm_s16le", mono());
        let params = StreamEncode {
            codec: Some("pcm_f32le".into()),
            sample_rate: Some(16_000),
            channel_layout: Some(ChannelLayout::Stereo),
            frame_size: Some(256),
            ..StreamEncode::default()
        };
        let settings = encoder_settings(&audio, &params, 1);
        assert_eq!(settings.stream_index, 1);
        assert_eq!(settings.codec, "pcm_f32le");
        assert_eq!(
            settings.audio,
            Some(AudioFormat::new(SampleFormat::S16, ChannelLayout::Stereo, 16_000))
        );
        assert_eq!(settings.time_base, Rational::new(1, 16_000));
        assert_eq!(settings.frame_size, Some(256));

        let video = StreamInfo::video(0, "rawvideo", VideoFormat::new(PixelFormat::Rgb24, 8, 8), Rational::new(30, 1));
        let params = StreamEncode {
            size: Some((4, 2)),
            pixel_format: Some(PixelFormat::Gray8),
            ..StreamEncode::default()
        };
        let settings = encoder_settings(&video, &params, 0);
        assert_eq!(settings.codec, "rawvideo");
        assert_eq!(settings.video, Some(VideoFormat::new(PixelFormat::Gray8, 4, 2)));
        assert_eq!(settings.frame_rate, Some(Rational::new(30, 1)));
    }

    #[test]
    fn test_filter_init_failure_is_stream_error() {
        let library = RawLibrary::default();
        let stream = StreamInfo::audio(0, "pcm_s16le", mono());
        let params = StreamEncode {
            filter: Some("scale=2:2".into()),
            ..StreamEncode::default()
        };
        let mut ctx = TranscoderContext::open(&library, &stream, &params, 0, None, None).unwrap();
        let mut muxer = VecMuxer::default();
        let err = ctx.process_packet(audio_packet(0, 64), &mut muxer, &library).unwrap_err();
        assert!(matches!(err, MediaError::FilterInit { stream: 0, .. }));
        assert!(!err.is_fatal_to_session());
    }
}
