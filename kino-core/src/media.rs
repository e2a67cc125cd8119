//! # Media Units
//!
//! Packets, frames and stream descriptions that flow between the demuxer,
//! the decode threads, the filter graphs and the encoders.
//!
//! Payloads are `bytes::Bytes`. Handing a unit to another thread moves it;
//! the only place two stages alias the same buffer is a hardware transfer,
//! where the derived frame may reference the source until the copy is done.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Time Base
// ============================================================================

/// Rational time base (seconds per tick).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    /// One tick per microsecond; the engine's internal clock unit.
    pub const MICROS: Rational = Rational { num: 1, den: 1_000_000 };

    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Convert `value` ticks of this base into ticks of `target`, rounding
    /// to the nearest tick.
    pub fn rescale(&self, value: i64, target: Rational) -> i64 {
        if !self.is_valid() || !target.is_valid() || *self == target {
            return value;
        }
        let num = value as i128 * self.num as i128 * target.den as i128;
        let den = self.den as i128 * target.num as i128;
        let half = den / 2;
        let rounded = if num >= 0 { (num + half) / den } else { (num - half) / den };
        rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn to_micros(&self, value: i64) -> i64 {
        self.rescale(value, Self::MICROS)
    }

    pub fn from_micros(&self, micros: i64) -> i64 {
        Self::MICROS.rescale(micros, *self)
    }
}

impl fmt::Debug for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self::MICROS
    }
}

// ============================================================================
// Formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl MediaType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Data => "data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba,
    Yuv420p,
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for one tightly packed picture.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        match self {
            Self::Gray8 => w * h,
            Self::Rgb24 => w * h * 3,
            Self::Rgba => w * h * 4,
            Self::Yuv420p | Self::Nv12 => w * h + 2 * chroma,
        }
    }

    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Gray8 => Some(1),
            Self::Rgb24 => Some(3),
            Self::Rgba => Some(4),
            Self::Yuv420p | Self::Nv12 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Surround51,
    Other(u16),
}

impl ChannelLayout {
    pub fn channels(&self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Surround51 => 6,
            Self::Other(n) => *n,
        }
    }

    pub fn from_channels(channels: u16) -> Self {
        match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            6 => Self::Surround51,
            n => Self::Other(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub layout: ChannelLayout,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn new(sample_format: SampleFormat, layout: ChannelLayout, sample_rate: u32) -> Self {
        Self {
            sample_format,
            layout,
            sample_rate,
        }
    }

    pub fn channels(&self) -> usize {
        self.layout.channels() as usize
    }

    /// Bytes per interleaved sample frame (one sample for every channel).
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels()
    }

    pub fn time_base(&self) -> Rational {
        Rational::new(1, self.sample_rate.max(1) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
    Subtitle,
}

impl FrameFormat {
    pub fn media_type(&self) -> MediaType {
        match self {
            Self::Video(_) => MediaType::Video,
            Self::Audio(_) => MediaType::Audio,
            Self::Subtitle => MediaType::Subtitle,
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

pub const PACKET_FLAG_KEY: u8 = 0x01;
/// Empty packet asking the decoder to drain its delayed frames.
pub const PACKET_FLAG_DRAIN: u8 = 0x02;

/// One encoded unit of a single stream.
#[derive(Clone)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub flags: u8,
    pub data: Bytes,
}

impl Packet {
    pub fn new(stream_index: usize, pts: i64, duration: i64, time_base: Rational, data: Bytes) -> Self {
        Self {
            stream_index,
            pts,
            dts: pts,
            duration,
            time_base,
            flags: 0,
            data,
        }
    }

    pub fn drain(stream_index: usize) -> Self {
        Self {
            stream_index,
            pts: 0,
            dts: 0,
            duration: 0,
            time_base: Rational::MICROS,
            flags: PACKET_FLAG_DRAIN,
            data: Bytes::new(),
        }
    }

    pub fn with_key_frame(mut self, key: bool) -> Self {
        self.set_key_frame(key);
        self
    }

    pub fn set_key_frame(&mut self, key: bool) {
        if key {
            self.flags |= PACKET_FLAG_KEY;
        } else {
            self.flags &= !PACKET_FLAG_KEY;
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & PACKET_FLAG_KEY != 0
    }

    pub fn is_drain(&self) -> bool {
        self.flags & PACKET_FLAG_DRAIN != 0
    }

    pub fn pts_us(&self) -> i64 {
        self.time_base.to_micros(self.pts)
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Move pts/dts/duration into another time base.
    pub fn rescale_ts(&mut self, target: Rational) {
        if self.time_base == target {
            return;
        }
        self.pts = self.time_base.rescale(self.pts, target);
        self.dts = self.time_base.rescale(self.dts, target);
        self.duration = self.time_base.rescale(self.duration, target);
        self.time_base = target;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("stream_index", &self.stream_index)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("duration", &self.duration)
            .field("time_base", &self.time_base)
            .field("key", &self.is_key_frame())
            .field("size", &self.data.len())
            .finish()
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Opaque handle to a surface living on a hardware device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSurface {
    pub device_id: u64,
    pub surface_id: u64,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub enum FrameBuffer {
    Host(Bytes),
    Device(DeviceSurface),
}

/// One decoded unit: a picture, a block of interleaved samples or a
/// subtitle event (UTF-8 text).
#[derive(Debug, Clone)]
pub struct Frame {
    pub pts: i64,
    pub duration: i64,
    pub time_base: Rational,
    pub format: FrameFormat,
    pub key_frame: bool,
    pub buffer: FrameBuffer,
}

impl Frame {
    pub fn host(pts: i64, duration: i64, time_base: Rational, format: FrameFormat, data: Bytes) -> Self {
        Self {
            pts,
            duration,
            time_base,
            format,
            key_frame: false,
            buffer: FrameBuffer::Host(data),
        }
    }

    pub fn media_type(&self) -> MediaType {
        self.format.media_type()
    }

    pub fn pts_us(&self) -> i64 {
        self.time_base.to_micros(self.pts)
    }

    pub fn duration_us(&self) -> i64 {
        self.time_base.to_micros(self.duration)
    }

    pub fn is_device(&self) -> bool {
        matches!(self.buffer, FrameBuffer::Device(_))
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.buffer {
            FrameBuffer::Host(data) => Some(data),
            FrameBuffer::Device(_) => None,
        }
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        match self.format {
            FrameFormat::Audio(format) => Some(format),
            _ => None,
        }
    }

    pub fn video_format(&self) -> Option<VideoFormat> {
        match self.format {
            FrameFormat::Video(format) => Some(format),
            _ => None,
        }
    }

    /// Samples per channel in an audio frame, zero otherwise.
    pub fn nb_samples(&self) -> usize {
        match (&self.format, &self.buffer) {
            (FrameFormat::Audio(format), FrameBuffer::Host(data)) => {
                data.len() / format.frame_bytes().max(1)
            }
            (FrameFormat::Audio(format), FrameBuffer::Device(surface)) => {
                surface.len / format.frame_bytes().max(1)
            }
            _ => 0,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match (&self.format, &self.buffer) {
            (FrameFormat::Subtitle, FrameBuffer::Host(data)) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Derive a frame carrying this frame's timing with a new buffer.
    pub fn derive(&self, format: FrameFormat, buffer: FrameBuffer) -> Self {
        Self {
            pts: self.pts,
            duration: self.duration,
            time_base: self.time_base,
            format,
            key_frame: self.key_frame,
            buffer,
        }
    }
}

// ============================================================================
// Stream / Media Description
// ============================================================================

/// Immutable description of one elementary stream as reported by a demuxer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: MediaType,
    pub codec: String,
    pub time_base: Rational,
    /// Duration in `time_base` ticks, zero when unknown.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub bit_rate: u64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub video: Option<VideoFormat>,
    #[serde(default)]
    pub frame_rate: Option<Rational>,
    #[serde(default)]
    pub audio: Option<AudioFormat>,
    /// Codec-specific options carried through the container.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl StreamInfo {
    pub fn new(index: usize, media_type: MediaType, codec: impl Into<String>, time_base: Rational) -> Self {
        Self {
            index,
            media_type,
            codec: codec.into(),
            time_base,
            duration: 0,
            bit_rate: 0,
            language: None,
            title: None,
            is_default: false,
            video: None,
            frame_rate: None,
            audio: None,
            options: BTreeMap::new(),
        }
    }

    pub fn video(index: usize, codec: impl Into<String>, format: VideoFormat, frame_rate: Rational) -> Self {
        let mut info = Self::new(index, MediaType::Video, codec, Rational::new(frame_rate.den, frame_rate.num));
        info.video = Some(format);
        info.frame_rate = Some(frame_rate);
        info
    }

    pub fn audio(index: usize, codec: impl Into<String>, format: AudioFormat) -> Self {
        let mut info = Self::new(index, MediaType::Audio, codec, format.time_base());
        info.audio = Some(format);
        info
    }

    pub fn subtitle(index: usize, codec: impl Into<String>) -> Self {
        Self::new(index, MediaType::Subtitle, codec, Rational::new(1, 1000))
    }

    pub fn duration_us(&self) -> i64 {
        self.time_base.to_micros(self.duration)
    }

    pub fn frame_format(&self) -> Option<FrameFormat> {
        match self.media_type {
            MediaType::Video => self.video.map(FrameFormat::Video),
            MediaType::Audio => self.audio.map(FrameFormat::Audio),
            MediaType::Subtitle => Some(FrameFormat::Subtitle),
            MediaType::Data => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start_us: i64,
    pub end_us: i64,
    pub title: String,
}

/// Snapshot of an opened container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub format_name: String,
    pub duration_us: i64,
    pub bit_rate: u64,
    pub metadata: BTreeMap<String, String>,
    pub chapters: Vec<Chapter>,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn streams_of(&self, media_type: MediaType) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |s| s.media_type == media_type)
    }

    /// Default stream of a type: the one flagged default, else the first.
    pub fn default_stream(&self, media_type: MediaType) -> Option<&StreamInfo> {
        self.streams_of(media_type)
            .find(|s| s.is_default)
            .or_else(|| self.streams_of(media_type).next())
    }

    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_rounds_to_nearest() {
        let tb_90k = Rational::new(1, 90_000);
        assert_eq!(tb_90k.to_micros(90_000), 1_000_000);
        assert_eq!(Rational::new(1, 25).rescale(3, tb_90k), 10_800);
        // 1/3 ms -> 333.33us rounds down, 2/3 ms rounds up
        assert_eq!(Rational::new(1, 3000).to_micros(1), 333);
        assert_eq!(Rational::new(1, 3000).to_micros(2), 667);
        assert_eq!(Rational::new(1, 3000).to_micros(-2), -667);
    }

    #[test]
    fn test_frame_sizes() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 4), 24);
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), 9 + 2 * 4);
        assert_eq!(PixelFormat::Rgb24.frame_size(2, 2), 12);
    }

    #[test]
    fn test_packet_flags_and_rescale() {
        let mut packet = Packet::new(1, 25, 1, Rational::new(1, 25), Bytes::from_static(b"x"))
            .with_key_frame(true);
        assert!(packet.is_key_frame());
        assert!(!packet.is_drain());
        packet.rescale_ts(Rational::new(1, 1000));
        assert_eq!(packet.pts, 1000);
        assert_eq!(packet.duration, 40);
        assert!(Packet::drain(0).is_drain());
    }

    #[test]
    fn test_audio_frame_samples() {
        let format = AudioFormat::new(SampleFormat::S16, ChannelLayout::Stereo, 48_000);
        let frame = Frame::host(
            0,
            512,
            format.time_base(),
            FrameFormat::Audio(format),
            Bytes::from(vec![0u8; 512 * 4]),
        );
        assert_eq!(frame.nb_samples(), 512);
        assert_eq!(frame.duration_us(), 10_667);
    }

    #[test]
    fn test_default_stream_selection() {
        let mut second = StreamInfo::subtitle(2, "text");
        second.is_default = true;
        let info = MediaInfo {
            path: PathBuf::from("a.kraw"),
            format_name: "kraw".into(),
            duration_us: 0,
            bit_rate: 0,
            metadata: BTreeMap::new(),
            chapters: Vec::new(),
            streams: vec![StreamInfo::subtitle(1, "text"), second],
        };
        assert_eq!(info.default_stream(MediaType::Subtitle).map(|s| s.index), Some(2));
        assert!(info.default_stream(MediaType::Audio).is_none());
    }
}
