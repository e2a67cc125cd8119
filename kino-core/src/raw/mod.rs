//! # Reference Backend
//!
//! Pure-Rust [`CodecLibrary`] over uncompressed codecs and the KRAW
//! container. It compresses nothing; it exists so playback and transcode
//! run end to end without native codec libraries.

pub mod codec;
pub mod container;
pub mod filter;
pub mod hw;
pub mod synth;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{
    CodecLibrary, Demuxer, EncoderSettings, FilterGraph, FilterSpec, FrameDecoder, FrameEncoder, HwDevice, Muxer,
};
use crate::error::{MediaError, Result};
use crate::hwaccel::HwDeviceKind;
use crate::media::{MediaType, StreamInfo};

pub use self::codec::{RawDecoder, RawEncoder};
pub use self::container::{KrawDemuxer, KrawMuxer};
pub use self::filter::RawFilterGraph;
pub use self::hw::LoopbackDevice;
pub use self::synth::{generate, SynthAudio, SynthSpec, SynthVideo};

/// Behaviour switches of the reference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawOptions {
    /// Device kinds offered for hardware decode/encode.
    pub hw_devices: Vec<HwDeviceKind>,
    /// Whether hardware encoders can be opened on those devices.
    pub hw_encoders: bool,
    /// Devices created from now on fail every download.
    pub fail_downloads: bool,
}

impl Default for RawOptions {
    fn default() -> Self {
        Self {
            hw_devices: vec![HwDeviceKind::Loopback],
            hw_encoders: true,
            fail_downloads: false,
        }
    }
}

#[derive(Default)]
pub struct RawLibrary {
    options: RawOptions,
}

impl RawLibrary {
    pub fn new(options: RawOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RawOptions {
        &self.options
    }
}

impl CodecLibrary for RawLibrary {
    fn name(&self) -> &str {
        "raw"
    }

    fn open_input(&self, path: &Path) -> Result<Box<dyn Demuxer>> {
        Ok(Box::new(KrawDemuxer::open(path)?))
    }

    fn open_output(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(KrawMuxer::create(path)?))
    }

    fn create_decoder(&self, stream: &StreamInfo, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameDecoder>> {
        Ok(Box::new(RawDecoder::new(stream, hw)?))
    }

    fn create_encoder(&self, settings: &EncoderSettings, hw: Option<Arc<dyn HwDevice>>) -> Result<Box<dyn FrameEncoder>> {
        if let Some(device) = &hw {
            if !self.options.hw_encoders || settings.media_type != MediaType::Video {
                return Err(MediaError::HardwareUnavailable(format!(
                    "no {} encoder for {} on {}",
                    settings.media_type.label(),
                    settings.codec,
                    device.kind().name()
                )));
            }
        }
        Ok(Box::new(RawEncoder::new(settings, hw)?))
    }

    fn create_filter_graph(&self, spec: &FilterSpec) -> Result<Box<dyn FilterGraph>> {
        Ok(Box::new(RawFilterGraph::new(spec)?))
    }

    fn create_hw_device(&self, kind: HwDeviceKind) -> Result<Arc<dyn HwDevice>> {
        if kind != HwDeviceKind::Loopback || !self.options.hw_devices.contains(&kind) {
            return Err(MediaError::HardwareUnavailable(kind.name().to_string()));
        }
        let device = LoopbackDevice::new();
        device.set_fail_downloads(self.options.fail_downloads);
        Ok(Arc::new(device))
    }

    fn hw_device_kinds(&self) -> Vec<HwDeviceKind> {
        self.options.hw_devices.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hwaccel;

    #[test]
    fn test_device_selection_falls_back() {
        let library = RawLibrary::new(RawOptions {
            hw_devices: vec![HwDeviceKind::Cuda, HwDeviceKind::Loopback],
            ..RawOptions::default()
        });
        let device = hwaccel::open_device(&library, Some(HwDeviceKind::Cuda)).unwrap();
        assert_eq!(device.kind(), HwDeviceKind::Loopback);

        let software = RawLibrary::new(RawOptions {
            hw_devices: Vec::new(),
            ..RawOptions::default()
        });
        assert!(hwaccel::open_device(&software, None).is_none());
    }

    #[test]
    fn test_encoder_lookup() {
        let library = RawLibrary::default();
        let aac = EncoderSettings::new(0, MediaType::Audio, "aac", crate::media::Rational::new(1, 48_000));
        assert!(library.create_encoder(&aac, None).is_err());

        let settings = EncoderSettings::new(0, MediaType::Audio, "pcm_s16le", crate::media::Rational::new(1, 48_000));
        let device = library.create_hw_device(HwDeviceKind::Loopback).unwrap();
        assert!(matches!(
            library.create_encoder(&settings, Some(device)),
            Err(MediaError::HardwareUnavailable(_))
        ));
    }
}
