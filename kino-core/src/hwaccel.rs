//! # Hardware Acceleration
//!
//! Device kinds, best-first device selection with software fallback, and
//! the host/device frame transfers that sit between a GPU decoder, the CPU
//! filter graph and a GPU encoder.
//!
//! A failed transfer is scoped to its stream: callers get a
//! [`MediaError::HardwareTransfer`] and the sibling streams keep running.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecLibrary, HwDevice};
use crate::error::{MediaError, Result};
use crate::media::{Frame, FrameBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HwDeviceKind {
    Cuda,       // NVIDIA
    Vaapi,      // Linux Intel/AMD
    Qsv,        // Intel Quick Sync
    VideoToolbox,
    D3d11va,
    /// In-process surfaces; always available, used by the reference backend.
    Loopback,
}

impl HwDeviceKind {
    /// Lower is tried first.
    pub fn priority(&self) -> u32 {
        match self {
            Self::Cuda => 1,
            Self::Qsv => 2,
            Self::Vaapi => 3,
            Self::VideoToolbox => 4,
            Self::D3d11va => 5,
            Self::Loopback => 50,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::VideoToolbox => "videotoolbox",
            Self::D3d11va => "d3d11va",
            Self::Loopback => "loopback",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "cuda" | "nvdec" | "nvenc" => Some(Self::Cuda),
            "vaapi" => Some(Self::Vaapi),
            "qsv" => Some(Self::Qsv),
            "videotoolbox" => Some(Self::VideoToolbox),
            "d3d11va" | "d3d11" => Some(Self::D3d11va),
            "loopback" => Some(Self::Loopback),
            _ => None,
        }
    }
}

/// Open the best device the library offers. `preferred` is tried first.
/// Returns `None` (software path) when nothing can be created.
pub fn open_device(library: &dyn CodecLibrary, preferred: Option<HwDeviceKind>) -> Option<Arc<dyn HwDevice>> {
    let mut kinds = library.hw_device_kinds();
    kinds.sort_by_key(|k| k.priority());
    if let Some(preferred) = preferred {
        kinds.retain(|k| *k != preferred);
        kinds.insert(0, preferred);
    }

    for kind in kinds {
        match library.create_hw_device(kind) {
            Ok(device) => {
                tracing::info!("Hardware device opened: {}", kind.name());
                return Some(device);
            }
            Err(e) => tracing::debug!("Hardware device {} unavailable: {}", kind.name(), e),
        }
    }
    tracing::info!("No hardware device available, using software path");
    None
}

/// Bring a frame into host memory. Host frames pass through untouched.
pub fn to_host(stream: usize, device: Option<&Arc<dyn HwDevice>>, frame: Frame) -> Result<Frame> {
    let FrameBuffer::Device(surface) = &frame.buffer else {
        return Ok(frame);
    };
    let device = device.ok_or_else(|| MediaError::HardwareTransfer {
        stream,
        reason: format!("no device for surface {}", surface.surface_id),
    })?;
    device
        .download(&frame)
        .map_err(|e| MediaError::HardwareTransfer {
            stream,
            reason: format!("download from {}: {}", device.kind().name(), e),
        })
}

/// Move a host frame onto `device`. Device frames pass through untouched.
pub fn to_device(stream: usize, device: &Arc<dyn HwDevice>, frame: Frame) -> Result<Frame> {
    if frame.is_device() {
        return Ok(frame);
    }
    device.upload(&frame).map_err(|e| MediaError::HardwareTransfer {
        stream,
        reason: format!("upload to {}: {}", device.kind().name(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameFormat, PixelFormat, Rational, VideoFormat};
    use bytes::Bytes;

    #[test]
    fn test_kind_parsing_and_priority() {
        assert_eq!(HwDeviceKind::from_name("NVENC"), Some(HwDeviceKind::Cuda));
        assert_eq!(HwDeviceKind::from_name("loopback"), Some(HwDeviceKind::Loopback));
        assert_eq!(HwDeviceKind::from_name("glide"), None);
        assert!(HwDeviceKind::Cuda.priority() < HwDeviceKind::Loopback.priority());
    }

    #[test]
    fn test_host_frame_passes_through() {
        let format = FrameFormat::Video(VideoFormat::new(PixelFormat::Gray8, 2, 2));
        let frame = Frame::host(0, 1, Rational::new(1, 25), format, Bytes::from_static(&[1, 2, 3, 4]));
        let host = to_host(0, None, frame).unwrap();
        assert_eq!(host.data().map(|d| d.len()), Some(4));
    }

    #[test]
    fn test_device_frame_without_device_fails_stream() {
        let format = FrameFormat::Video(VideoFormat::new(PixelFormat::Gray8, 2, 2));
        let frame = Frame::host(0, 1, Rational::new(1, 25), format, Bytes::new()).derive(
            format,
            FrameBuffer::Device(crate::media::DeviceSurface {
                device_id: 1,
                surface_id: 9,
                len: 4,
            }),
        );
        let err = to_host(4, None, frame).unwrap_err();
        assert!(matches!(err, MediaError::HardwareTransfer { stream: 4, .. }));
    }
}
