//! # Codec Boundary
//!
//! Traits the engine drives. Container parsing and bitstream coding live
//! behind these, in a [`CodecLibrary`] implementation; the engine itself
//! only moves packets and frames between them.
//!
//! "No output yet" is [`CodecError::Again`], an ordinary value the callers
//! loop on. Only [`CodecError::Fatal`] is turned into a [`MediaError`] and
//! recorded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{MediaError, Result};
use crate::hwaccel::HwDeviceKind;
use crate::media::{
    AudioFormat, Chapter, Frame, FrameFormat, MediaInfo, MediaType, Packet, Rational, StreamInfo,
    VideoFormat,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("End of stream")]
    EndOfStream,
    #[error("{0}")]
    Fatal(String),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Treat `Again` as an empty batch; everything else passes through.
pub fn or_empty<T>(result: CodecResult<Vec<T>>) -> CodecResult<Vec<T>> {
    match result {
        Err(CodecError::Again) => Ok(Vec::new()),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDirection {
    /// Land on the last key frame at or before the target.
    Backward,
    /// Land on the first key frame at or after the target.
    Forward,
}

// ============================================================================
// Demux / Mux
// ============================================================================

pub trait Demuxer: Send {
    fn format_name(&self) -> &str;

    fn streams(&self) -> &[StreamInfo];

    fn duration_us(&self) -> i64;

    fn bit_rate(&self) -> u64 {
        0
    }

    fn metadata(&self) -> &BTreeMap<String, String>;

    fn chapters(&self) -> &[Chapter];

    /// Next packet in file order; `EndOfStream` once exhausted.
    fn read_packet(&mut self) -> CodecResult<Packet>;

    fn seek(&mut self, position_us: i64, direction: SeekDirection) -> CodecResult<()>;

    fn media_info(&self, path: &Path) -> MediaInfo {
        MediaInfo {
            path: path.to_path_buf(),
            format_name: self.format_name().to_string(),
            duration_us: self.duration_us(),
            bit_rate: self.bit_rate(),
            metadata: self.metadata().clone(),
            chapters: self.chapters().to_vec(),
            streams: self.streams().to_vec(),
        }
    }
}

pub trait Muxer: Send {
    /// Register an output stream; returns its index in the output.
    fn add_stream(&mut self, info: StreamInfo) -> Result<usize>;

    fn set_metadata(&mut self, _metadata: BTreeMap<String, String>) {}

    fn set_chapters(&mut self, _chapters: Vec<Chapter>) {}

    fn write_header(&mut self) -> Result<()>;

    /// Write with dts interleaving across streams.
    fn write_interleaved(&mut self, packet: Packet) -> Result<()>;

    fn write_trailer(&mut self) -> Result<()>;
}

// ============================================================================
// Decode / Encode / Filter
// ============================================================================

pub trait FrameDecoder: Send {
    fn name(&self) -> &str;

    /// Decode one packet into zero or more frames.
    fn decode(&mut self, packet: &Packet) -> CodecResult<Vec<Frame>>;

    /// Return frames still held back at end of input.
    fn drain(&mut self) -> CodecResult<Vec<Frame>>;

    /// Discard internal state, e.g. after a seek.
    fn flush(&mut self);

    fn time_base(&self) -> Rational;

    /// Frames come out as device surfaces.
    fn is_hardware(&self) -> bool {
        false
    }
}

pub trait FrameEncoder: Send {
    fn name(&self) -> &str;

    /// Encode a frame, or flush with `None`. Returns every packet ready.
    fn encode(&mut self, frame: Option<&Frame>) -> CodecResult<Vec<Packet>>;

    /// Exact samples per audio frame the encoder insists on, if any.
    fn frame_size(&self) -> Option<usize> {
        None
    }

    fn time_base(&self) -> Rational;

    /// Description of the stream the encoder produces.
    fn output_stream(&self) -> StreamInfo;

    /// Input frames must be device surfaces.
    fn is_hardware(&self) -> bool {
        false
    }
}

pub trait FilterGraph: Send {
    fn description(&self) -> &str;

    /// Feed a frame (or `None` for end of stream) and collect filtered output.
    fn push(&mut self, frame: Option<Frame>) -> CodecResult<Vec<Frame>>;

    fn output_format(&self) -> FrameFormat;
}

/// Graph construction request. `target` is the format the consumer needs;
/// the graph converts to it after the described filters.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub stream_index: usize,
    pub description: String,
    pub input: FrameFormat,
    pub time_base: Rational,
    pub target: Option<FrameFormat>,
}

// ============================================================================
// Hardware
// ============================================================================

pub trait HwDevice: Send + Sync {
    fn kind(&self) -> HwDeviceKind;

    fn id(&self) -> u64;

    /// Device surface -> host memory.
    fn download(&self, frame: &Frame) -> CodecResult<Frame>;

    /// Host memory -> device surface.
    fn upload(&self, frame: &Frame) -> CodecResult<Frame>;
}

// ============================================================================
// Encoder Settings
// ============================================================================

/// Fully resolved parameters for one encoder instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub stream_index: usize,
    pub media_type: MediaType,
    pub codec: String,
    pub time_base: Rational,
    #[serde(default)]
    pub bit_rate: Option<u64>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub crf: Option<u8>,
    #[serde(default)]
    pub video: Option<VideoFormat>,
    #[serde(default)]
    pub frame_rate: Option<Rational>,
    #[serde(default)]
    pub audio: Option<AudioFormat>,
    #[serde(default)]
    pub frame_size: Option<usize>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl EncoderSettings {
    pub fn new(stream_index: usize, media_type: MediaType, codec: impl Into<String>, time_base: Rational) -> Self {
        Self {
            stream_index,
            media_type,
            codec: codec.into(),
            time_base,
            bit_rate: None,
            profile: None,
            preset: None,
            crf: None,
            video: None,
            frame_rate: None,
            audio: None,
            frame_size: None,
            options: BTreeMap::new(),
        }
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

// ============================================================================
// Library
// ============================================================================

/// Factory for everything on the far side of the codec boundary.
pub trait CodecLibrary: Send + Sync {
    fn name(&self) -> &str;

    fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>>;

    fn open_output(&self, path: &Path) -> Result<Box<dyn Muxer>>;

    fn create_decoder(&self, stream: &StreamInfo, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameDecoder>>;

    fn create_encoder(&self, settings: &EncoderSettings, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameEncoder>>;

    fn create_filter_graph(&self, spec: &FilterSpec) -> Result<Box<dyn FilterGraph>>;

    fn create_hw_device(&self, kind: HwDeviceKind) -> Result<Arc<dyn HwDevice>>;

    /// Device kinds this library can try, best first.
    fn hw_device_kinds(&self) -> Vec<HwDeviceKind> {
        Vec::new()
    }
}

/// Map a fatal boundary error on `stream` into the engine taxonomy.
pub fn decode_error(stream: usize, error: CodecError) -> MediaError {
    MediaError::Decode {
        stream,
        reason: error.to_string(),
    }
}

pub fn encode_error(stream: usize, error: CodecError) -> MediaError {
    MediaError::Encode {
        stream,
        reason: error.to_string(),
    }
}
