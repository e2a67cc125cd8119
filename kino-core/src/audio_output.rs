//! # Audio Output
//!
//! Audio display consumer. The device format is negotiated once per stream
//! start; decoded frames are converted (sample format, channel layout,
//! linear resampling), scaled by the volume and written to the sink.
//!
//! Conversion goes through interleaved `f32`.

use std::sync::Arc;

use crate::decoder::{DecoderStrategy, StageContext};
use crate::error::Result;
use crate::event::Event;
use crate::media::{AudioFormat, Frame, SampleFormat};
use crate::presenter::{Pace, Pacer};
use crate::render::AudioSink;

// ============================================================================
// Format Negotiation
// ============================================================================

/// Pick the device format for a stream: exact match, then same rate and
/// channels, then same rate, then the device's preferred format.
pub fn negotiate(source: AudioFormat, supported: &[AudioFormat], preferred: AudioFormat) -> AudioFormat {
    if supported.contains(&source) {
        return source;
    }
    supported
        .iter()
        .find(|f| f.sample_rate == source.sample_rate && f.channels() == source.channels())
        .or_else(|| supported.iter().find(|f| f.sample_rate == source.sample_rate))
        .copied()
        .unwrap_or(preferred)
}

// ============================================================================
// Sample Conversion
// ============================================================================

pub fn to_f32(data: &[u8], format: SampleFormat) -> Vec<f32> {
    match format {
        SampleFormat::U8 => data.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect(),
        SampleFormat::S16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32_768.0)
            .collect(),
        SampleFormat::S32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / 2_147_483_648.0)
            .collect(),
        SampleFormat::F32 => data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

pub fn from_f32(samples: &[f32], format: SampleFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * format.bytes_per_sample());
    for &s in samples {
        let s = s.clamp(-1.0, 1.0);
        match format {
            SampleFormat::U8 => out.push((s * 127.0 + 128.0).round() as u8),
            SampleFormat::S16 => out.extend_from_slice(&((s * 32_767.0).round() as i16).to_le_bytes()),
            SampleFormat::S32 => {
                out.extend_from_slice(&((s as f64 * 2_147_483_647.0).round() as i32).to_le_bytes())
            }
            SampleFormat::F32 => out.extend_from_slice(&s.to_le_bytes()),
        }
    }
    out
}

/// Up/down mix interleaved samples between channel counts.
///
/// Fewer outputs average the inputs folding onto them; more outputs repeat
/// inputs round-robin. Mono to stereo duplicates, stereo to mono averages.
pub fn remix(samples: &[f32], in_channels: usize, out_channels: usize) -> Vec<f32> {
    if in_channels == out_channels || in_channels == 0 || out_channels == 0 {
        return samples.to_vec();
    }
    let frames = samples.len() / in_channels;
    let mut out = Vec::with_capacity(frames * out_channels);
    for frame in samples.chunks_exact(in_channels) {
        for c in 0..out_channels {
            if out_channels < in_channels {
                let (sum, n) = frame
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| j % out_channels == c)
                    .fold((0.0f32, 0usize), |(sum, n), (_, s)| (sum + s, n + 1));
                out.push(sum / n.max(1) as f32);
            } else {
                out.push(frame[c % in_channels]);
            }
        }
    }
    out
}

/// Stateful linear-interpolation resampler; carries the last input sample
/// frame across calls so block boundaries stay continuous.
pub struct LinearResampler {
    channels: usize,
    step: f64,
    position: f64,
    last: Vec<f32>,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            step: in_rate as f64 / out_rate.max(1) as f64,
            position: 0.0,
            last: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        let ch = self.channels;
        let frames = input.len() / ch;
        if frames == 0 {
            return Vec::new();
        }

        // index -1 refers to the carried-over frame
        let sample = |i: i64, c: usize| -> f32 {
            if i < 0 {
                self.last.get(c).copied().unwrap_or(input[c])
            } else {
                input[i as usize * ch + c]
            }
        };

        let mut out = Vec::with_capacity((frames as f64 / self.step) as usize * ch + ch);
        while (self.position.floor() as i64) < frames as i64 - 1 {
            let i0 = self.position.floor() as i64;
            let frac = (self.position - i0 as f64) as f32;
            for c in 0..ch {
                let s0 = sample(i0, c);
                let s1 = sample(i0 + 1, c);
                out.push(s0 + (s1 - s0) * frac);
            }
            self.position += self.step;
        }

        self.position -= frames as f64;
        self.last = input[(frames - 1) * ch..frames * ch].to_vec();
        out
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last.clear();
    }
}

/// Converts one stream's frames into the negotiated device format.
pub struct AudioConverter {
    source: AudioFormat,
    target: AudioFormat,
    resampler: LinearResampler,
}

impl AudioConverter {
    pub fn new(source: AudioFormat, target: AudioFormat) -> Self {
        Self {
            source,
            target,
            resampler: LinearResampler::new(source.sample_rate, target.sample_rate, target.channels()),
        }
    }

    pub fn target(&self) -> AudioFormat {
        self.target
    }

    pub fn is_identity(&self) -> bool {
        self.source == self.target
    }

    /// Convert interleaved `data` and apply `gain`.
    pub fn convert(&mut self, data: &[u8], gain: f32) -> Vec<u8> {
        if self.is_identity() && gain == 1.0 {
            return data.to_vec();
        }
        let samples = to_f32(data, self.source.sample_format);
        let mut samples = remix(&samples, self.source.channels(), self.target.channels());
        samples = self.resampler.process(&samples);
        if gain != 1.0 {
            samples.iter_mut().for_each(|s| *s *= gain);
        }
        from_f32(&samples, self.target.sample_format)
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

// ============================================================================
// Audio Display Stage
// ============================================================================

pub struct AudioOutput {
    pacer: Pacer,
    sink: Arc<dyn AudioSink>,
    converter: Option<AudioConverter>,
    volume: f32,
    muted: bool,
    paused: bool,
}

impl AudioOutput {
    pub fn new(pacer: Pacer, sink: Arc<dyn AudioSink>, volume: f32) -> Self {
        Self {
            pacer,
            sink,
            converter: None,
            volume: volume.clamp(0.0, 1.0),
            muted: false,
            paused: false,
        }
    }

    fn gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

impl DecoderStrategy<Frame> for AudioOutput {
    fn on_start(&mut self, stage: &StageContext) -> Result<()> {
        if let Some(source) = stage.stream().audio {
            let target = negotiate(source, &self.sink.supported_formats(), self.sink.preferred_format());
            tracing::debug!("audio: {:?} -> device {:?}", source, target);
            self.converter = Some(AudioConverter::new(source, target));
        }
        Ok(())
    }

    fn handle_event(&mut self, _stage: &StageContext, event: &Event) {
        match event {
            Event::Pause(paused) => {
                self.paused = *paused;
                self.pacer.set_paused(*paused);
            }
            Event::Volume(volume) => self.volume = volume.clamp(0.0, 1.0),
            Event::Mute(muted) => self.muted = *muted,
            _ => {}
        }
    }

    fn on_seek(&mut self, _stage: &StageContext, position_us: i64) {
        self.sink.flush();
        if let Some(converter) = self.converter.as_mut() {
            converter.reset();
        }
        self.pacer.on_seek(position_us);
    }

    fn handle_unit(&mut self, stage: &StageContext, frame: Frame) {
        match self.pacer.pace(stage, frame.pts_us()) {
            Pace::Present => {}
            Pace::Late(_) | Pace::Stale | Pace::Cancelled => {
                self.pacer.stats().dropped();
                return;
            }
        }
        let Some(data) = frame.data() else {
            self.pacer.stats().dropped();
            return;
        };

        // Frames whose format drifted from the stream header get their own converter.
        if let Some(format) = frame.audio_format() {
            let stale = self.converter.as_ref().map(|c| c.source != format).unwrap_or(true);
            if stale {
                let target = negotiate(format, &self.sink.supported_formats(), self.sink.preferred_format());
                self.converter = Some(AudioConverter::new(format, target));
            }
        }

        let gain = self.gain();
        if let Some(converter) = self.converter.as_mut() {
            let out = converter.convert(data, gain);
            self.sink.write(&out, converter.target());
        }
        self.pacer.stats().rendered();
        self.pacer.report_position();
    }

    fn is_paused(&self) -> bool {
        self.paused
    }
}
