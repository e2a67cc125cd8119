//! Uncompressed codecs: `rawvideo`, `pcm_*` and `text`.
//!
//! Nothing is compressed, but the encoder behaves like a real one where the
//! pipeline cares: `rawvideo` can hold frames back (`lookahead` option, the
//! way B-frame encoders delay output) and marks key frames every `gop`
//! frames; PCM encoders can insist on a fixed frame size.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec::{CodecError, CodecResult, EncoderSettings, FrameDecoder, FrameEncoder, HwDevice};
use crate::error::{MediaError, Result};
use crate::media::{
    AudioFormat, Frame, FrameFormat, MediaType, Packet, Rational, SampleFormat, StreamInfo,
};

pub const RAWVIDEO: &str = "rawvideo";
pub const TEXT: &str = "text";

/// Sample format a PCM codec name stands for.
pub fn pcm_sample_format(codec: &str) -> Option<SampleFormat> {
    match codec {
        "pcm_u8" => Some(SampleFormat::U8),
        "pcm_s16le" => Some(SampleFormat::S16),
        "pcm_s32le" => Some(SampleFormat::S32),
        "pcm_f32le" => Some(SampleFormat::F32),
        _ => None,
    }
}

pub fn pcm_codec_name(format: SampleFormat) -> &'static str {
    match format {
        SampleFormat::U8 => "pcm_u8",
        SampleFormat::S16 => "pcm_s16le",
        SampleFormat::S32 => "pcm_s32le",
        SampleFormat::F32 => "pcm_f32le",
    }
}

pub fn is_supported(codec: &str, media_type: MediaType) -> bool {
    match media_type {
        MediaType::Video => codec == RAWVIDEO,
        MediaType::Audio => pcm_sample_format(codec).is_some(),
        MediaType::Subtitle => codec == TEXT,
        MediaType::Data => false,
    }
}

/// Frame format implied by a codec name and the stream's parameters.
fn frame_format(
    codec: &str,
    media_type: MediaType,
    video: Option<crate::media::VideoFormat>,
    audio: Option<AudioFormat>,
) -> Result<FrameFormat> {
    if !is_supported(codec, media_type) {
        return Err(MediaError::CodecNotFound(format!("{} ({})", codec, media_type.label())));
    }
    match media_type {
        MediaType::Video => video
            .map(FrameFormat::Video)
            .ok_or_else(|| MediaError::CodecNotFound(format!("{}: missing picture format", codec))),
        MediaType::Audio => {
            let mut audio =
                audio.ok_or_else(|| MediaError::CodecNotFound(format!("{}: missing sample format", codec)))?;
            if let Some(sample_format) = pcm_sample_format(codec) {
                audio.sample_format = sample_format;
            }
            Ok(FrameFormat::Audio(audio))
        }
        _ => Ok(FrameFormat::Subtitle),
    }
}

fn option<T: std::str::FromStr>(options: &std::collections::BTreeMap<String, String>, key: &str) -> Option<T> {
    options.get(key).and_then(|v| v.parse().ok())
}

// ============================================================================
// Decoder
// ============================================================================

pub struct RawDecoder {
    name: String,
    stream_index: usize,
    time_base: Rational,
    format: FrameFormat,
    device: Option<Arc<dyn HwDevice>>,
}

impl RawDecoder {
    /// With a device, pictures come out as device surfaces.
    pub fn new(stream: &StreamInfo, device: Option<Arc<dyn HwDevice>>) -> Result<Self> {
        let format = frame_format(&stream.codec, stream.media_type, stream.video, stream.audio)?;
        let device = if stream.media_type == MediaType::Video { device } else { None };
        let name = match &device {
            Some(d) => format!("{}_{}", stream.codec, d.kind().name()),
            None => stream.codec.clone(),
        };
        Ok(Self {
            name,
            stream_index: stream.index,
            time_base: stream.time_base,
            format,
            device,
        })
    }

    fn validate(&self, data: &[u8]) -> CodecResult<()> {
        match self.format {
            FrameFormat::Video(video) if data.len() != video.frame_size() => Err(CodecError::Fatal(format!(
                "stream {}: picture is {} bytes, expected {}",
                self.stream_index,
                data.len(),
                video.frame_size()
            ))),
            FrameFormat::Audio(audio) if data.len() % audio.frame_bytes().max(1) != 0 => Err(CodecError::Fatal(
                format!("stream {}: truncated sample frame", self.stream_index),
            )),
            FrameFormat::Subtitle if std::str::from_utf8(data).is_err() => {
                Err(CodecError::Fatal(format!("stream {}: subtitle is not UTF-8", self.stream_index)))
            }
            _ => Ok(()),
        }
    }
}

impl FrameDecoder for RawDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn decode(&mut self, packet: &Packet) -> CodecResult<Vec<Frame>> {
        if packet.is_drain() {
            return self.drain();
        }
        self.validate(&packet.data)?;

        let mut frame = Frame::host(packet.pts, packet.duration, packet.time_base, self.format, packet.data.clone());
        frame.key_frame = packet.is_key_frame();
        if let Some(device) = &self.device {
            frame = device.upload(&frame)?;
        }
        Ok(vec![frame])
    }

    fn drain(&mut self) -> CodecResult<Vec<Frame>> {
        Ok(Vec::new())
    }

    fn flush(&mut self) {}

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn is_hardware(&self) -> bool {
        self.device.is_some()
    }
}

// ============================================================================
// Encoder
// ============================================================================

pub struct RawEncoder {
    name: String,
    settings: EncoderSettings,
    format: FrameFormat,
    time_base: Rational,
    device: Option<Arc<dyn HwDevice>>,
    lookahead: usize,
    gop: u64,
    frame_size: Option<usize>,
    held: VecDeque<Packet>,
    frames_in: u64,
    short_frame_seen: bool,
    flushed: bool,
}

impl RawEncoder {
    pub fn new(settings: &EncoderSettings, device: Option<Arc<dyn HwDevice>>) -> Result<Self> {
        let format = frame_format(&settings.codec, settings.media_type, settings.video, settings.audio)?;
        let time_base = match format {
            FrameFormat::Audio(audio) => audio.time_base(),
            _ => settings.time_base,
        };
        if !time_base.is_valid() {
            return Err(MediaError::Encode {
                stream: settings.stream_index,
                reason: format!("invalid time base {:?}", time_base),
            });
        }
        let frame_size = match format {
            FrameFormat::Audio(_) => settings.frame_size.filter(|&n| n > 0),
            _ => None,
        };
        let name = match &device {
            Some(d) => format!("{}_{}", settings.codec, d.kind().name()),
            None => settings.codec.clone(),
        };

        Ok(Self {
            name,
            settings: settings.clone(),
            format,
            time_base,
            device,
            lookahead: option(&settings.options, "lookahead").unwrap_or(0),
            gop: option::<u64>(&settings.options, "gop").unwrap_or(1).max(1),
            frame_size,
            held: VecDeque::new(),
            frames_in: 0,
            short_frame_seen: false,
            flushed: false,
        })
    }

    fn host_frame(&self, frame: &Frame) -> CodecResult<Frame> {
        match (&self.device, frame.is_device()) {
            (Some(device), true) => device.download(frame),
            (Some(_), false) => Err(CodecError::Fatal(format!("{}: expects device frames", self.name))),
            (None, true) => Err(CodecError::Fatal(format!("{}: cannot read device frames", self.name))),
            (None, false) => Ok(frame.clone()),
        }
    }

    fn check_frame_size(&mut self, frame: &Frame) -> CodecResult<()> {
        let Some(required) = self.frame_size else {
            return Ok(());
        };
        let samples = frame.nb_samples();
        if self.short_frame_seen {
            return Err(CodecError::Fatal(format!("{}: frame after the final short frame", self.name)));
        }
        if samples > required {
            return Err(CodecError::Fatal(format!(
                "{}: {} samples, frame size is {}",
                self.name, samples, required
            )));
        }
        if samples < required {
            self.short_frame_seen = true;
        }
        Ok(())
    }
}

impl FrameEncoder for RawEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&mut self, frame: Option<&Frame>) -> CodecResult<Vec<Packet>> {
        if self.flushed {
            return Err(CodecError::EndOfStream);
        }
        let Some(frame) = frame else {
            self.flushed = true;
            return Ok(self.held.drain(..).collect());
        };

        let frame = self.host_frame(frame)?;
        if frame.format != self.format {
            return Err(CodecError::Fatal(format!(
                "{}: got {:?}, configured for {:?}",
                self.name, frame.format, self.format
            )));
        }
        self.check_frame_size(&frame)?;
        let Some(data) = frame.data().cloned() else {
            return Err(CodecError::Fatal(format!("{}: empty frame", self.name)));
        };

        let pts = frame.time_base.rescale(frame.pts, self.time_base);
        let duration = match self.format {
            FrameFormat::Audio(_) => frame.nb_samples() as i64,
            _ => frame.time_base.rescale(frame.duration, self.time_base).max(1),
        };
        let key = match self.format {
            FrameFormat::Video(_) => self.frames_in % self.gop == 0,
            _ => true,
        };
        self.frames_in += 1;

        let mut packet = Packet::new(self.settings.stream_index, pts, duration, self.time_base, data).with_key_frame(key);
        // Delayed output shifts dts back the way reordering encoders do.
        packet.dts = pts - self.lookahead as i64 * duration;
        self.held.push_back(packet);

        let mut ready = Vec::new();
        while self.held.len() > self.lookahead {
            if let Some(packet) = self.held.pop_front() {
                ready.push(packet);
            }
        }
        if ready.is_empty() {
            return Err(CodecError::Again);
        }
        Ok(ready)
    }

    fn frame_size(&self) -> Option<usize> {
        self.frame_size
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn output_stream(&self) -> StreamInfo {
        let s = &self.settings;
        let mut info = StreamInfo::new(s.stream_index, s.media_type, s.codec.clone(), self.time_base);
        info.bit_rate = s.bit_rate.unwrap_or(0);
        match self.format {
            FrameFormat::Video(video) => {
                info.video = Some(video);
                info.frame_rate = s.frame_rate;
            }
            FrameFormat::Audio(audio) => info.audio = Some(audio),
            FrameFormat::Subtitle => {}
        }
        info
    }

    fn is_hardware(&self) -> bool {
        self.device.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{ChannelLayout, PixelFormat, VideoFormat};
    use bytes::Bytes;

    fn video_settings(lookahead: usize) -> EncoderSettings {
        let mut settings = EncoderSettings::new(0, MediaType::Video, RAWVIDEO, Rational::new(1, 25));
        settings.video = Some(VideoFormat::new(PixelFormat::Gray8, 2, 2));
        settings.options.insert("lookahead".into(), lookahead.to_string());
        settings.options.insert("gop".into(), "3".into());
        settings
    }

    fn picture(pts: i64) -> Frame {
        let format = FrameFormat::Video(VideoFormat::new(PixelFormat::Gray8, 2, 2));
        Frame::host(pts, 1, Rational::new(1, 25), format, Bytes::from(vec![pts as u8; 4]))
    }

    #[test]
    fn test_lookahead_delays_until_flush() {
        let mut encoder = RawEncoder::new(&video_settings(2), None).unwrap();
        assert!(matches!(encoder.encode(Some(&picture(0))), Err(CodecError::Again)));
        assert!(matches!(encoder.encode(Some(&picture(1))), Err(CodecError::Again)));
        let out = encoder.encode(Some(&picture(2))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts, 0);
        assert_eq!(out[0].dts, -2);
        assert!(out[0].is_key_frame());

        let rest = encoder.encode(None).unwrap();
        assert_eq!(rest.iter().map(|p| p.pts).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!rest[0].is_key_frame());
        assert!(matches!(encoder.encode(None), Err(CodecError::EndOfStream)));
    }

    #[test]
    fn test_pcm_frame_size_enforced() {
        let audio = AudioFormat::new(SampleFormat::S16, ChannelLayout::Mono, 8_000);
        let mut settings = EncoderSettings::new(1, MediaType::Audio, "pcm_s16le", audio.time_base());
        settings.audio = Some(audio);
        settings.frame_size = Some(4);
        let mut encoder = RawEncoder::new(&settings, None).unwrap();
        assert_eq!(encoder.frame_size(), Some(4));

        let block = |pts: i64, samples: usize| {
            Frame::host(pts, samples as i64, audio.time_base(), FrameFormat::Audio(audio), Bytes::from(vec![0u8; samples * 2]))
        };
        assert_eq!(encoder.encode(Some(&block(0, 4))).unwrap()[0].duration, 4);
        assert!(encoder.encode(Some(&block(4, 5))).is_err());
        assert!(encoder.encode(Some(&block(4, 2))).is_ok());
        assert!(encoder.encode(Some(&block(6, 4))).is_err());
    }

    #[test]
    fn test_decoder_validates_payload() {
        let stream = StreamInfo::video(0, RAWVIDEO, VideoFormat::new(PixelFormat::Gray8, 2, 2), Rational::new(25, 1));
        let mut decoder = RawDecoder::new(&stream, None).unwrap();
        let good = Packet::new(0, 3, 1, stream.time_base, Bytes::from(vec![1u8; 4])).with_key_frame(true);
        let frames = decoder.decode(&good).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].key_frame);
        assert_eq!(frames[0].data().map(|d| d.as_ref()), Some(&[1u8, 1, 1, 1][..]));

        let bad = Packet::new(0, 4, 1, stream.time_base, Bytes::from(vec![1u8; 3]));
        assert!(matches!(decoder.decode(&bad), Err(CodecError::Fatal(_))));

        let unknown = StreamInfo::new(1, MediaType::Video, "h264", Rational::new(1, 25));
        assert!(matches!(RawDecoder::new(&unknown, None), Err(MediaError::CodecNotFound(_))));
    }
}
