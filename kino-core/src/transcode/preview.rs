//! Thumbnail extraction on a private demux/decode pair, so it can run
//! while a transcode of the same file is in progress.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_error, or_empty, CodecError, CodecLibrary, Demuxer, FrameDecoder, SeekDirection};
use crate::error::{MediaError, Result};
use crate::media::{Frame, MediaType, StreamInfo, VideoFormat};

/// Back-off when the demuxer has no data yet.
const IDLE_SLEEP: Duration = Duration::from_millis(2);
/// Idle polls allowed over one whole preview run.
const MAX_IDLE_POLLS: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewImage {
    /// Position in the preview list.
    pub index: usize,
    pub requested_us: i64,
    /// Pts of the decoded picture, at or after `requested_us` when possible.
    pub pts_us: i64,
    pub format: VideoFormat,
    /// No picture could be decoded near this position; the nearest
    /// neighbour's picture stands in.
    pub substituted: bool,
    #[serde(skip)]
    pub data: Bytes,
}

/// Decode the first key frame at or after each of `count` evenly spaced
/// positions. The list always has `count` entries in position order. A
/// position with no decodable picture repeats the nearest earlier one (or
/// the first later one) and is marked `substituted`.
pub fn generate_previews(library: &dyn CodecLibrary, path: &Path, count: usize) -> Result<Vec<PreviewImage>> {
    let mut demuxer = library.open_input(path)?;
    let info = demuxer.media_info(path);
    let stream = info
        .default_stream(MediaType::Video)
        .cloned()
        .ok_or_else(|| MediaError::InvalidState(format!("no video stream in {}", path.display())))?;
    let mut decoder = library.create_decoder(&stream, None)?;
    let mut idle_polls = 0;

    let mut slots: Vec<Option<(i64, VideoFormat, Bytes)>> = Vec::with_capacity(count);
    for index in 0..count {
        let requested_us = info.duration_us * index as i64 / count as i64;
        let mut frame = None;
        for direction in [SeekDirection::Forward, SeekDirection::Backward] {
            if let Err(e) = demuxer.seek(requested_us, direction) {
                tracing::debug!("preview {}: seek {:?} failed: {}", index, direction, e);
                continue;
            }
            decoder.flush();
            frame = first_key_frame(demuxer.as_mut(), decoder.as_mut(), &stream, &mut idle_polls)?;
            if frame.is_some() {
                break;
            }
        }

        let picture = frame.and_then(|f| Some((f.pts_us(), f.video_format()?, f.data()?.clone())));
        if picture.is_none() {
            tracing::debug!("preview {}: nothing decodable near {}us", index, requested_us);
        }
        slots.push(picture);
    }

    let Some(first) = slots.iter().flatten().next().cloned() else {
        return Err(MediaError::InvalidState(format!(
            "no decodable picture in {}",
            path.display()
        )));
    };

    let mut previews = Vec::with_capacity(count);
    let mut nearest = first;
    for (index, slot) in slots.into_iter().enumerate() {
        let substituted = slot.is_none();
        if let Some(picture) = slot {
            nearest = picture;
        }
        let (pts_us, format, data) = nearest.clone();
        previews.push(PreviewImage {
            index,
            requested_us: info.duration_us * index as i64 / count as i64,
            pts_us,
            format,
            substituted,
            data,
        });
    }
    tracing::debug!(
        "{} previews from {} ({} substituted)",
        previews.len(),
        path.display(),
        previews.iter().filter(|p| p.substituted).count()
    );
    Ok(previews)
}

fn first_key_frame(
    demuxer: &mut dyn Demuxer,
    decoder: &mut dyn FrameDecoder,
    stream: &StreamInfo,
    idle_polls: &mut u32,
) -> Result<Option<Frame>> {
    let mut keyed = false;
    loop {
        let packet = match demuxer.read_packet() {
            Ok(packet) => packet,
            Err(CodecError::Again) if *idle_polls < MAX_IDLE_POLLS => {
                *idle_polls += 1;
                std::thread::sleep(IDLE_SLEEP);
                continue;
            }
            Err(CodecError::Again) => {
                tracing::debug!("preview: demuxer stayed dry, giving up on this position");
                return Ok(None);
            }
            Err(CodecError::EndOfStream) => break,
            Err(e) => return Err(decode_error(stream.index, e)),
        };
        if packet.stream_index != stream.index {
            continue;
        }
        keyed |= packet.is_key_frame();
        if !keyed {
            continue;
        }
        match or_empty(decoder.decode(&packet)) {
            Ok(frames) => {
                if let Some(frame) = frames.into_iter().next() {
                    return Ok(Some(frame));
                }
            }
            Err(CodecError::EndOfStream) => break,
            Err(e) => return Err(decode_error(stream.index, e)),
        }
    }

    match or_empty(decoder.drain()) {
        Ok(frames) => Ok(frames.into_iter().next()),
        Err(CodecError::EndOfStream) => Ok(None),
        Err(e) => Err(decode_error(stream.index, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{PixelFormat, Rational};
    use crate::raw::{generate, RawLibrary, SynthSpec, SynthVideo};

    #[test]
    fn test_previews_are_ordered_key_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.kraw");
        generate(
            &path,
            &SynthSpec {
                duration_us: 1_000_000,
                video: Some(SynthVideo {
                    format: VideoFormat::new(PixelFormat::Gray8, 4, 4),
                    frame_rate: Rational::new(25, 1),
                    gop: 5,
                }),
                audio: Vec::new(),
                subtitles: Vec::new(),
                title: None,
            },
        )
        .unwrap();

        let previews = generate_previews(&RawLibrary::default(), &path, 4).unwrap();
        assert_eq!(previews.len(), 4);
        let requested: Vec<i64> = previews.iter().map(|p| p.requested_us).collect();
        assert_eq!(requested, vec![0, 250_000, 500_000, 750_000]);
        let landed: Vec<i64> = previews.iter().map(|p| p.pts_us).collect();
        assert_eq!(landed, vec![0, 400_000, 600_000, 800_000]);
        for preview in &previews {
            assert!(!preview.substituted);
            assert!(preview.pts_us >= preview.requested_us);
            // Each synthetic picture is filled with its frame number.
            assert_eq!(preview.data[0] as i64, preview.pts_us / 40_000);
            assert_eq!(preview.format.width, 4);
        }
    }

    #[test]
    fn test_audio_only_has_no_previews() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.kraw");
        generate(
            &path,
            &SynthSpec {
                duration_us: 200_000,
                video: None,
                audio: vec![crate::raw::SynthAudio {
                    format: crate::media::AudioFormat::new(
                        crate::media::SampleFormat::S16,
                        crate::media::ChannelLayout::Mono,
                        8_000,
                    ),
                    samples_per_packet: 400,
                }],
                subtitles: Vec::new(),
                title: None,
            },
        )
        .unwrap();
        let err = generate_previews(&RawLibrary::default(), &path, 3).unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
    }
}
