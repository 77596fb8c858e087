//! Ports to the outside world: camera devices, frame streams, cancellation
//! and live preview.
//!
//! A session opens its camera once, reads frames from the returned stream
//! and drops the stream on every exit path. Dropping the stream releases
//! the device.

use crate::types::BoundingBox;
use image::GrayImage;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not available: {0}")]
    Unavailable(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// An open camera session. Dropping it releases the device.
pub trait FrameStream: Send {
    /// Block for the next grayscale frame. `Ok(None)` means end of stream.
    fn read_frame(&mut self) -> Result<Option<GrayImage>, CaptureError>;
}

/// Something a session can open for exclusive frame capture.
pub trait CameraDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError>;

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}

impl<T: CameraDevice + ?Sized> CameraDevice for &T {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        (**self).open()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Cooperative cancellation flag, polled once per session tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wraps a camera so that at most one stream is open at a time.
///
/// A second `open` while a stream is alive fails with [`CaptureError::Busy`]
/// instead of fighting over the device.
pub struct ExclusiveCamera<C> {
    inner: C,
    in_use: Arc<AtomicBool>,
}

impl<C: CameraDevice> ExclusiveCamera<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl<C: CameraDevice> CameraDevice for ExclusiveCamera<C> {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::Busy(self.inner.describe()));
        }
        match self.inner.open() {
            Ok(stream) => Ok(Box::new(ExclusiveStream {
                stream: Some(stream),
                in_use: Arc::clone(&self.in_use),
            })),
            Err(e) => {
                self.in_use.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

struct ExclusiveStream {
    stream: Option<Box<dyn FrameStream>>,
    in_use: Arc<AtomicBool>,
}

impl FrameStream for ExclusiveStream {
    fn read_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_frame(),
            None => Ok(None),
        }
    }
}

impl Drop for ExclusiveStream {
    fn drop(&mut self) {
        // Release the device before clearing the flag.
        drop(self.stream.take());
        self.in_use.store(false, Ordering::SeqCst);
    }
}

/// A "camera" that replays a fixed list of frames and then reports end of stream.
///
/// Used to recognise faces in still images with the same loop as live capture.
#[derive(Clone)]
pub struct StillCamera {
    frames: Vec<GrayImage>,
}

impl StillCamera {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self { frames }
    }
}

impl CameraDevice for StillCamera {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        Ok(Box::new(StillStream {
            frames: self.frames.iter().cloned().collect(),
        }))
    }

    fn describe(&self) -> String {
        format!("{} still image(s)", self.frames.len())
    }
}

struct StillStream {
    frames: VecDeque<GrayImage>,
}

impl FrameStream for StillStream {
    fn read_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        Ok(self.frames.pop_front())
    }
}

/// Observer for annotated frames. Never read back by the pipeline.
pub trait PreviewSink: Send {
    fn show(&mut self, frame: &GrayImage, faces: &[BoundingBox]);
}

/// Discards every frame.
pub struct NoPreview;

impl PreviewSink for NoPreview {
    fn show(&mut self, _frame: &GrayImage, _faces: &[BoundingBox]) {}
}

/// Copy `frame` with a 2-pixel white outline drawn around each face.
pub fn annotate(frame: &GrayImage, faces: &[BoundingBox]) -> GrayImage {
    let mut out = frame.clone();
    let white = image::Luma([255u8]);
    for face in faces {
        let Some(b) = face.clamp_to(out.width(), out.height()) else {
            continue;
        };
        let outer = Rect::at(b.x as i32, b.y as i32).of_size(b.width, b.height);
        draw_hollow_rect_mut(&mut out, outer, white);
        if b.width > 2 && b.height > 2 {
            let inner = Rect::at(b.x as i32 + 1, b.y as i32 + 1).of_size(b.width - 2, b.height - 2);
            draw_hollow_rect_mut(&mut out, inner, white);
        }
    }
    out
}
