//! Sample FIFO that re-frames variable-size decoded audio into the fixed
//! frame size an encoder demands.

use bytes::{Bytes, BytesMut};

use crate::media::{AudioFormat, Frame, FrameFormat, Rational};

pub struct AudioFifo {
    format: AudioFormat,
    buffer: BytesMut,
    /// Pts of the first buffered sample, in 1/sample_rate ticks.
    next_pts: Option<i64>,
}

impl AudioFifo {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            buffer: BytesMut::new(),
            next_pts: None,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Buffered, unread samples per channel.
    pub fn size(&self) -> usize {
        self.buffer.len() / self.format.frame_bytes().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append interleaved sample frames. Trailing partial sample frames are ignored.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let frame_bytes = self.format.frame_bytes().max(1);
        let whole = data.len() - data.len() % frame_bytes;
        self.buffer.extend_from_slice(&data[..whole]);
        whole / frame_bytes
    }

    /// Append an audio frame, adopting its pts if the FIFO was empty.
    pub fn write_frame(&mut self, frame: &Frame) -> usize {
        let Some(data) = frame.data() else {
            return 0;
        };
        if self.next_pts.is_none() || self.is_empty() {
            self.next_pts = Some(frame.time_base.rescale(frame.pts, self.format.time_base()));
        }
        self.write(data)
    }

    /// Read exactly `samples` samples, or `None` if fewer are buffered.
    pub fn read(&mut self, samples: usize) -> Option<Bytes> {
        if samples == 0 || self.size() < samples {
            return None;
        }
        let bytes = self.buffer.split_to(samples * self.format.frame_bytes()).freeze();
        if let Some(pts) = self.next_pts.as_mut() {
            *pts += samples as i64;
        }
        Some(bytes)
    }

    /// Read up to `samples` samples; used for the final short frame.
    pub fn read_partial(&mut self, samples: usize) -> Option<Bytes> {
        let available = self.size().min(samples);
        self.read(available)
    }

    /// Pop a full `samples`-long frame timed in 1/sample_rate.
    pub fn read_frame(&mut self, samples: usize) -> Option<Frame> {
        let pts = self.next_pts.unwrap_or(0);
        let data = self.read(samples)?;
        Some(self.make_frame(pts, data))
    }

    /// Pop whatever is left as one short frame.
    pub fn flush_frame(&mut self) -> Option<Frame> {
        let pts = self.next_pts.unwrap_or(0);
        let data = self.read_partial(self.size())?;
        Some(self.make_frame(pts, data))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.next_pts = None;
    }

    fn make_frame(&self, pts: i64, data: Bytes) -> Frame {
        let samples = data.len() / self.format.frame_bytes().max(1);
        let time_base: Rational = self.format.time_base();
        Frame::host(pts, samples as i64, time_base, FrameFormat::Audio(self.format), data)
    }
}
