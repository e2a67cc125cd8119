//! # Render Sinks
//!
//! Where finished units leave the engine. Display consumers hand frames to
//! every registered sink; windowing and device output live behind these
//! traits in the embedding application.
//!
//! Sink lists are swapped concurrently by the UI. The list lock only covers
//! the swap; sinks are called on a snapshot, never under the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::media::{AudioFormat, ChannelLayout, Frame, SampleFormat};
use crate::subtitle_output::SubtitleEvent;

pub trait VideoSink: Send + Sync {
    fn render(&self, frame: &Frame);
}

pub trait AudioSink: Send + Sync {
    /// Formats the device accepts without conversion.
    fn supported_formats(&self) -> Vec<AudioFormat>;

    /// Fallback when no supported format matches the stream.
    fn preferred_format(&self) -> AudioFormat;

    /// Interleaved samples in the negotiated format.
    fn write(&self, data: &[u8], format: AudioFormat);

    /// Drop anything buffered in the device (seek).
    fn flush(&self) {}
}

pub trait SubtitleSink: Send + Sync {
    /// Currently active events, replaced wholesale on every change.
    fn show(&self, events: &[SubtitleEvent]);
}

// ============================================================================
// Sink List
// ============================================================================

pub struct SinkList<S: ?Sized> {
    sinks: RwLock<Vec<Arc<S>>>,
}

impl<S: ?Sized> Default for SinkList<S> {
    fn default() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }
}

impl<S: ?Sized> SinkList<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, sinks: Vec<Arc<S>>) {
        *self.sinks.write() = sinks;
    }

    pub fn add(&self, sink: Arc<S>) {
        self.sinks.write().push(sink);
    }

    pub fn clear(&self) {
        self.sinks.write().clear();
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.sinks.read().clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&S)) {
        for sink in self.snapshot() {
            f(&sink);
        }
    }
}

pub type VideoSinks = SinkList<dyn VideoSink>;
pub type SubtitleSinks = SinkList<dyn SubtitleSink>;

// ============================================================================
// Null Audio Output
// ============================================================================

/// Audio device that accepts one format and discards the samples.
pub struct NullAudioSink {
    format: AudioFormat,
    bytes_written: AtomicU64,
}

impl Default for NullAudioSink {
    fn default() -> Self {
        Self::new(AudioFormat::new(SampleFormat::F32, ChannelLayout::Stereo, 48_000))
    }
}

impl NullAudioSink {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl AudioSink for NullAudioSink {
    fn supported_formats(&self) -> Vec<AudioFormat> {
        vec![self.format]
    }

    fn preferred_format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, data: &[u8], _format: AudioFormat) {
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
    }
}
