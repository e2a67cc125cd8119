//! CPU filter graphs for the reference backend.
//!
//! Descriptions are comma-separated filter chains:
//! `null`, `anull`, `scale=W:H`, `volume=GAIN`. After the chain the graph
//! converts to the requested target format (picture size and packed pixel
//! format for video; sample format, channels and rate for audio).

use bytes::Bytes;

use crate::audio_output::AudioConverter;
use crate::codec::{CodecError, CodecResult, FilterGraph, FilterSpec};
use crate::error::{MediaError, Result};
use crate::media::{AudioFormat, Frame, FrameBuffer, FrameFormat, PixelFormat, Rational, VideoFormat};

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterOp {
    Null,
    Scale { width: u32, height: u32 },
    Volume(f32),
}

fn parse_chain(spec: &FilterSpec) -> Result<Vec<FilterOp>> {
    let fail = |reason: String| MediaError::FilterInit {
        stream: spec.stream_index,
        reason,
    };
    let mut ops = Vec::new();
    for part in spec.description.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, args) = part.split_once('=').unwrap_or((part, ""));
        let op = match name {
            "null" | "anull" | "copy" => FilterOp::Null,
            "scale" => {
                let (w, h) = args
                    .split_once(':')
                    .ok_or_else(|| fail(format!("scale needs W:H, got '{}'", args)))?;
                let width = w.parse().map_err(|_| fail(format!("bad width '{}'", w)))?;
                let height = h.parse().map_err(|_| fail(format!("bad height '{}'", h)))?;
                if width == 0 || height == 0 {
                    return Err(fail("scale to an empty picture".into()));
                }
                FilterOp::Scale { width, height }
            }
            "volume" => FilterOp::Volume(args.parse().map_err(|_| fail(format!("bad gain '{}'", args)))?),
            other => return Err(fail(format!("unknown filter '{}'", other))),
        };
        ops.push(op);
    }
    Ok(ops)
}

// ============================================================================
// Graph
// ============================================================================

enum Chain {
    Video {
        input: VideoFormat,
        output: VideoFormat,
    },
    Audio {
        output: AudioFormat,
        gain: f32,
        converter: AudioConverter,
    },
    Passthrough,
}

pub struct RawFilterGraph {
    description: String,
    stream_index: usize,
    chain: Chain,
    output: FrameFormat,
    finished: bool,
}

impl RawFilterGraph {
    pub fn new(spec: &FilterSpec) -> Result<Self> {
        let ops = parse_chain(spec)?;
        let fail = |reason: String| MediaError::FilterInit {
            stream: spec.stream_index,
            reason,
        };

        let (chain, output) = match spec.input {
            FrameFormat::Video(input) => {
                let mut output = input;
                for op in &ops {
                    match op {
                        FilterOp::Scale { width, height } => {
                            output.width = *width;
                            output.height = *height;
                        }
                        FilterOp::Volume(_) => return Err(fail("volume on a video stream".into())),
                        FilterOp::Null => {}
                    }
                }
                if let Some(FrameFormat::Video(target)) = spec.target {
                    output = target;
                }
                if output.pixel_format != input.pixel_format
                    && (input.pixel_format.bytes_per_pixel().is_none() || output.pixel_format.bytes_per_pixel().is_none())
                {
                    return Err(fail(format!(
                        "no conversion from {:?} to {:?}",
                        input.pixel_format, output.pixel_format
                    )));
                }
                (Chain::Video { input, output }, FrameFormat::Video(output))
            }
            FrameFormat::Audio(input) => {
                let mut gain = 1.0f32;
                for op in &ops {
                    match op {
                        FilterOp::Volume(g) => gain *= g,
                        FilterOp::Scale { .. } => return Err(fail("scale on an audio stream".into())),
                        FilterOp::Null => {}
                    }
                }
                let output = match spec.target {
                    Some(FrameFormat::Audio(target)) => target,
                    _ => input,
                };
                let converter = AudioConverter::new(input, output);
                (Chain::Audio { output, gain, converter }, FrameFormat::Audio(output))
            }
            FrameFormat::Subtitle => {
                if ops.iter().any(|op| *op != FilterOp::Null) {
                    return Err(fail("only null filters apply to subtitles".into()));
                }
                (Chain::Passthrough, FrameFormat::Subtitle)
            }
        };

        tracing::debug!(
            "Filter graph for stream {}: '{}' -> {:?}",
            spec.stream_index,
            spec.description,
            output
        );
        Ok(Self {
            description: spec.description.clone(),
            stream_index: spec.stream_index,
            chain,
            output,
            finished: false,
        })
    }
}

impl FilterGraph for RawFilterGraph {
    fn description(&self) -> &str {
        &self.description
    }

    fn push(&mut self, frame: Option<Frame>) -> CodecResult<Vec<Frame>> {
        if self.finished {
            return Err(CodecError::EndOfStream);
        }
        let Some(frame) = frame else {
            self.finished = true;
            return Ok(Vec::new());
        };
        let Some(data) = frame.data() else {
            return Err(CodecError::Fatal(format!(
                "stream {}: filter graph needs host frames",
                self.stream_index
            )));
        };

        let out = match &mut self.chain {
            Chain::Passthrough => frame.clone(),
            Chain::Video { input, output } => {
                if frame.video_format() != Some(*input) {
                    return Err(CodecError::Fatal(format!(
                        "stream {}: picture format changed to {:?}",
                        self.stream_index, frame.format
                    )));
                }
                let picture = convert_picture(data, *input, *output);
                frame.derive(FrameFormat::Video(*output), FrameBuffer::Host(Bytes::from(picture)))
            }
            Chain::Audio { output, gain, converter } => {
                let samples = converter.convert(data, *gain);
                let time_base: Rational = output.time_base();
                let mut out = frame.derive(FrameFormat::Audio(*output), FrameBuffer::Host(Bytes::from(samples)));
                out.pts = frame.time_base.rescale(frame.pts, time_base);
                out.duration = out.nb_samples() as i64;
                out.time_base = time_base;
                out
            }
        };
        Ok(vec![out])
    }

    fn output_format(&self) -> FrameFormat {
        self.output
    }
}

// ============================================================================
// Picture Conversion
// ============================================================================

fn convert_picture(data: &[u8], input: VideoFormat, output: VideoFormat) -> Vec<u8> {
    let scaled = if (input.width, input.height) == (output.width, output.height) {
        data.to_vec()
    } else {
        scale_picture(data, input, output.width, output.height)
    };
    if input.pixel_format == output.pixel_format {
        scaled
    } else {
        convert_packed(&scaled, input.pixel_format, output.pixel_format)
    }
}

/// Nearest-neighbour scale of every plane.
fn scale_picture(data: &[u8], input: VideoFormat, width: u32, height: u32) -> Vec<u8> {
    let (sw, sh) = (input.width as usize, input.height as usize);
    let (dw, dh) = (width as usize, height as usize);
    match input.pixel_format.bytes_per_pixel() {
        Some(bpp) => scale_plane(data, sw, sh, bpp, dw, dh),
        None => {
            let luma = sw * sh;
            let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
            let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
            let chroma = scw * sch;
            let mut out = scale_plane(data.get(..luma).unwrap_or_default(), sw, sh, 1, dw, dh);
            match input.pixel_format {
                PixelFormat::Nv12 => {
                    let uv = data.get(luma..luma + 2 * chroma).unwrap_or_default();
                    out.extend(scale_plane(uv, scw, sch, 2, dcw, dch));
                }
                _ => {
                    let u = data.get(luma..luma + chroma).unwrap_or_default();
                    let v = data.get(luma + chroma..luma + 2 * chroma).unwrap_or_default();
                    out.extend(scale_plane(u, scw, sch, 1, dcw, dch));
                    out.extend(scale_plane(v, scw, sch, 1, dcw, dch));
                }
            }
            out
        }
    }
}

fn scale_plane(src: &[u8], sw: usize, sh: usize, bpp: usize, dw: usize, dh: usize) -> Vec<u8> {
    let mut out = vec![0u8; dw * dh * bpp];
    if sw == 0 || sh == 0 || src.len() < sw * sh * bpp {
        return out;
    }
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            let s = (sy * sw + sx) * bpp;
            let d = (y * dw + x) * bpp;
            out[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
        }
    }
    out
}

fn convert_packed(data: &[u8], from: PixelFormat, to: PixelFormat) -> Vec<u8> {
    let (Some(in_bpp), Some(out_bpp)) = (from.bytes_per_pixel(), to.bytes_per_pixel()) else {
        return data.to_vec();
    };
    let pixels = data.len() / in_bpp;
    let mut out = Vec::with_capacity(pixels * out_bpp);
    for px in data.chunks_exact(in_bpp) {
        let (r, g, b, a) = match from {
            PixelFormat::Gray8 => (px[0], px[0], px[0], 255),
            PixelFormat::Rgb24 => (px[0], px[1], px[2], 255),
            _ => (px[0], px[1], px[2], px[3]),
        };
        match to {
            PixelFormat::Gray8 => {
                out.push(((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8);
            }
            PixelFormat::Rgb24 => out.extend_from_slice(&[r, g, b]),
            _ => out.extend_from_slice(&[r, g, b, a]),
        }
    }
    out
}
