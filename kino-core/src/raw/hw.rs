//! Loopback hardware device: "device memory" is a surface table in the
//! process. Lets the GPU decode/encode paths and their host transfers run
//! without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::{CodecError, CodecResult, HwDevice};
use crate::hwaccel::HwDeviceKind;
use crate::media::{DeviceSurface, Frame, FrameBuffer};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

pub struct LoopbackDevice {
    id: u64,
    surfaces: Mutex<HashMap<u64, Bytes>>,
    next_surface: AtomicU64,
    fail_downloads: AtomicBool,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            surfaces: Mutex::new(HashMap::new()),
            next_surface: AtomicU64::new(1),
            fail_downloads: AtomicBool::new(false),
        }
    }

    /// Make every later download fail, as a lost device would.
    pub fn set_fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Surfaces uploaded and not yet downloaded.
    pub fn live_surfaces(&self) -> usize {
        self.surfaces.lock().len()
    }
}

impl HwDevice for LoopbackDevice {
    fn kind(&self) -> HwDeviceKind {
        HwDeviceKind::Loopback
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn download(&self, frame: &Frame) -> CodecResult<Frame> {
        let FrameBuffer::Device(surface) = &frame.buffer else {
            return Ok(frame.clone());
        };
        if surface.device_id != self.id {
            return Err(CodecError::Fatal(format!(
                "surface {} belongs to device {}",
                surface.surface_id, surface.device_id
            )));
        }
        if self.fail_downloads.load(Ordering::SeqCst) {
            self.surfaces.lock().remove(&surface.surface_id);
            return Err(CodecError::Fatal("device lost".into()));
        }
        let data = self
            .surfaces
            .lock()
            .remove(&surface.surface_id)
            .ok_or_else(|| CodecError::Fatal(format!("unknown surface {}", surface.surface_id)))?;
        Ok(frame.derive(frame.format, FrameBuffer::Host(data)))
    }

    fn upload(&self, frame: &Frame) -> CodecResult<Frame> {
        let Some(data) = frame.data() else {
            return Ok(frame.clone());
        };
        let surface_id = self.next_surface.fetch_add(1, Ordering::Relaxed);
        self.surfaces.lock().insert(surface_id, data.clone());
        Ok(frame.derive(
            frame.format,
            FrameBuffer::Device(DeviceSurface {
                device_id: self.id,
                surface_id,
                len: data.len(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FrameFormat, PixelFormat, Rational, VideoFormat};

    fn gray_frame() -> Frame {
        let format = FrameFormat::Video(VideoFormat::new(PixelFormat::Gray8, 2, 2));
        Frame::host(7, 1, Rational::new(1, 25), format, Bytes::from_static(&[9, 9, 9, 9]))
    }

    #[test]
    fn test_upload_download_round_trip() {
        let device = LoopbackDevice::new();
        let surface = device.upload(&gray_frame()).unwrap();
        assert!(surface.is_device());
        assert_eq!(surface.pts, 7);
        assert_eq!(device.live_surfaces(), 1);

        let host = device.download(&surface).unwrap();
        assert_eq!(host.data().map(|d| d.as_ref()), Some(&[9u8, 9, 9, 9][..]));
        assert_eq!(device.live_surfaces(), 0);
    }

    #[test]
    fn test_failed_download() {
        let device = LoopbackDevice::new();
        let surface = device.upload(&gray_frame()).unwrap();
        device.set_fail_downloads(true);
        assert!(matches!(device.download(&surface), Err(CodecError::Fatal(_))));
        assert_eq!(device.live_surfaces(), 0);

        let other = LoopbackDevice::new();
        assert!(other.download(&device.upload(&gray_frame()).unwrap()).is_err());
    }
}
