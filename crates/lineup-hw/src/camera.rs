//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, FrameError, PixelFormat};
use image::GrayImage;
use lineup_core::{CameraDevice, CaptureError, FrameStream};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceBusy(_) => CaptureError::Busy(e.to_string()),
            CameraError::CaptureFailed(_) | CameraError::Frame(_) => {
                CaptureError::ReadFailed(e.to_string())
            }
            _ => CaptureError::Unavailable(e.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// V4L2 camera device handle with a negotiated grayscale-convertible format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and negotiate
    /// a format as close to `width` x `height` as the driver allows.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        // Ask for YUYV; drivers that cannot do it hand back what they can.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(&fourcc.repr).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc} (need YUYV, GREY, Y16 or MJPG)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming. The device is released when the stream is dropped.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        Ok(CameraStream {
            stream,
            camera: self,
        })
    }

    /// Capture a single grayscale frame on a short-lived stream.
    pub fn capture_frame(&self) -> Result<GrayImage, CameraError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?;
        let (buf, _meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        Ok(frame::to_grayscale(
            buf,
            self.pixel_format,
            self.width,
            self.height,
        )?)
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
            {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// A running capture stream. Field order matters: the stream stops before
/// the device handle closes.
pub struct CameraStream {
    stream: MmapStream<'static>,
    camera: Camera,
}

impl FrameStream for CameraStream {
    fn read_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        let (buf, meta) = self.stream.next().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
        })?;
        tracing::trace!(seq = meta.sequence, bytes = buf.len(), "frame dequeued");
        let gray = frame::to_grayscale(
            buf,
            self.camera.pixel_format,
            self.camera.width,
            self.camera.height,
        )
        .map_err(CameraError::from)?;
        Ok(Some(gray))
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        tracing::debug!(device = %self.camera.device_path, "releasing camera");
    }
}

/// A V4L2 device path plus the resolution to request, opened per session.
#[derive(Debug, Clone)]
pub struct DeviceCamera {
    pub path: String,
    pub width: u32,
    pub height: u32,
}

impl DeviceCamera {
    pub fn new(path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            path: path.into(),
            width,
            height,
        }
    }
}

impl CameraDevice for DeviceCamera {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        let stream = Camera::open(&self.path, self.width, self.height)?.into_stream()?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{} ({}x{})", self.path, self.width, self.height)
    }
}
