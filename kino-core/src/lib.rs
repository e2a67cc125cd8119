//! # Kino Core
//!
//! Threaded media playback and transcode engine.
//!
//! Every elementary stream runs on its own decode thread, fed through a
//! bounded queue. A shared clock keeps audio, video and subtitles in step,
//! and seeks are coordinated across all stream threads with a countdown
//! latch. The transcoder chains decode, filter and encode per stream into
//! an output container. Codecs and containers sit behind [`codec`] traits;
//! [`raw`] is the pure-Rust reference backend.

// ============================================================================
// Foundation
// ============================================================================
pub mod config;
pub mod error;
pub mod media;

// ============================================================================
// Threading Primitives
// ============================================================================
pub mod event;
pub mod latch;
pub mod queue;

// ============================================================================
// Codec Boundary
// ============================================================================
pub mod audio_fifo;
pub mod codec;
pub mod hwaccel;
pub mod raw;

// ============================================================================
// Playback
// ============================================================================
pub mod audio_output;
pub mod clock;
pub mod decoder;
pub mod demux;
pub mod packet_decoder;
pub mod player;
pub mod presenter;
pub mod render;
pub mod subtitle_output;
pub mod video_output;

// ============================================================================
// Transcode
// ============================================================================
pub mod transcode;

pub use codec::{CodecError, CodecLibrary};
pub use config::{ConfigError, EngineConfig};
pub use error::{recorder, MediaError, Result};
pub use event::{Event, MediaState, Notification};
pub use media::{Frame, MediaInfo, MediaType, Packet, Rational, StreamInfo};
pub use player::Player;
pub use raw::RawLibrary;
pub use render::{AudioSink, SubtitleSink, VideoSink};
pub use transcode::{EncodeContext, StreamEncode, TranscodeNotification, TranscodeReport, TranscodeState, Transcoder};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
