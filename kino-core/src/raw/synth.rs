//! Synthetic KRAW files: a counting picture, a ramp tone and a few text
//! events. Used by the tests and the `kino generate` command.

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::Muxer;
use crate::error::Result;
use crate::media::{AudioFormat, Chapter, Packet, Rational, StreamInfo, VideoFormat};

use super::codec::{pcm_codec_name, RAWVIDEO, TEXT};
use super::container::KrawMuxer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthVideo {
    pub format: VideoFormat,
    pub frame_rate: Rational,
    /// Key frame every `gop` pictures.
    pub gop: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthAudio {
    pub format: AudioFormat,
    pub samples_per_packet: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthSpec {
    pub duration_us: i64,
    pub video: Option<SynthVideo>,
    pub audio: Vec<SynthAudio>,
    /// `(start_us, end_us, text)` events on one text stream.
    pub subtitles: Vec<(i64, i64, String)>,
    pub title: Option<String>,
}

impl SynthSpec {
    pub fn stream_count(&self) -> usize {
        self.video.iter().count() + self.audio.len() + usize::from(!self.subtitles.is_empty())
    }
}

/// Write `spec` to `path`, returning the packet count per stream.
pub fn generate(path: &Path, spec: &SynthSpec) -> Result<Vec<u64>> {
    let mut muxer = KrawMuxer::create(path)?;
    let mut sources: Vec<Vec<Packet>> = Vec::new();

    if let Some(video) = &spec.video {
        let info = StreamInfo::video(0, RAWVIDEO, video.format, video.frame_rate);
        let index = muxer.add_stream(info.clone())?;
        let frame_us = info.time_base.to_micros(1).max(1);
        let count = spec.duration_us / frame_us;
        let gop = video.gop.max(1) as i64;
        sources.push(
            (0..count)
                .map(|n| {
                    let data = Bytes::from(vec![(n % 256) as u8; video.format.frame_size()]);
                    Packet::new(index, n, 1, info.time_base, data).with_key_frame(n % gop == 0)
                })
                .collect(),
        );
    }

    for (i, audio) in spec.audio.iter().enumerate() {
        let mut info = StreamInfo::audio(0, pcm_codec_name(audio.format.sample_format), audio.format);
        info.is_default = i == 0;
        let index = muxer.add_stream(info.clone())?;
        let total = Rational::MICROS.rescale(spec.duration_us, info.time_base);
        let per_packet = audio.samples_per_packet.max(1) as i64;
        let mut packets = Vec::new();
        let mut pts = 0i64;
        while pts < total {
            let samples = per_packet.min(total - pts);
            let data = ramp(audio.format, pts, samples as usize);
            packets.push(Packet::new(index, pts, samples, info.time_base, Bytes::from(data)).with_key_frame(true));
            pts += samples;
        }
        sources.push(packets);
    }

    if !spec.subtitles.is_empty() {
        let info = StreamInfo::subtitle(0, TEXT);
        let index = muxer.add_stream(info.clone())?;
        sources.push(
            spec.subtitles
                .iter()
                .map(|(start, end, text)| {
                    let pts = info.time_base.from_micros(*start);
                    let duration = info.time_base.from_micros(end - start);
                    Packet::new(index, pts, duration, info.time_base, Bytes::from(text.clone().into_bytes()))
                        .with_key_frame(true)
                })
                .collect(),
        );
    }

    let mut metadata = BTreeMap::new();
    if let Some(title) = &spec.title {
        metadata.insert("title".to_string(), title.clone());
    }
    muxer.set_metadata(metadata);
    muxer.set_chapters(vec![Chapter {
        start_us: 0,
        end_us: spec.duration_us,
        title: "Main".into(),
    }]);
    muxer.write_header()?;

    let counts = sources.iter().map(|s| s.len() as u64).collect();
    let mut packets: Vec<Packet> = sources.into_iter().flatten().collect();
    packets.sort_by_key(|p| p.time_base.to_micros(p.dts));
    for packet in packets {
        muxer.write_interleaved(packet)?;
    }
    muxer.write_trailer()?;
    Ok(counts)
}

/// Sawtooth whose phase follows the absolute sample position.
fn ramp(format: AudioFormat, start: i64, samples: usize) -> Vec<u8> {
    let values: Vec<f32> = (0..samples)
        .flat_map(|i| {
            let v = (((start + i as i64) % 100) as f32 / 100.0) - 0.5;
            std::iter::repeat(v).take(format.channels())
        })
        .collect();
    crate::audio_output::from_f32(&values, format.sample_format)
}
