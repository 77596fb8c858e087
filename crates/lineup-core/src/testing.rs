//! Scripted camera, locator and store doubles plus synthetic face patterns.

use crate::capture::{CameraDevice, CancelToken, CaptureError, FrameStream, PreviewSink};
use crate::detector::FaceLocator;
use crate::store::{SampleStore, StoreError};
use crate::types::{BoundingBox, Sample, SampleKey, Subject};
use image::GrayImage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const FACE_SIZE: u32 = 32;
pub const FRAME_SIZE: u32 = 96;

pub fn stripes(size: u32, period: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, _| {
        image::Luma([if (x / period) % 2 == 0 { 30 } else { 220 }])
    })
}

pub fn checker(size: u32, cell: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| {
        image::Luma([if ((x / cell) + (y / cell)) % 2 == 0 { 40 } else { 200 }])
    })
}

/// A black frame with `face` pasted at each position.
pub fn frame_with(face: &GrayImage, at: &[(u32, u32)]) -> GrayImage {
    let mut frame = GrayImage::new(FRAME_SIZE, FRAME_SIZE);
    for &(x, y) in at {
        image::imageops::replace(&mut frame, face, x as i64, y as i64);
    }
    frame
}

pub fn blank_frame() -> GrayImage {
    GrayImage::new(FRAME_SIZE, FRAME_SIZE)
}

/// Reports a fixed set of boxes, skipping any whose region is entirely black.
pub struct FixedLocator {
    boxes: Vec<BoundingBox>,
}

impl FixedLocator {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self { boxes }
    }

    pub fn at(positions: &[(u32, u32)]) -> Self {
        Self::new(
            positions
                .iter()
                .map(|&(x, y)| BoundingBox::new(x, y, FACE_SIZE, FACE_SIZE))
                .collect(),
        )
    }
}

impl FaceLocator for FixedLocator {
    fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox> {
        self.boxes
            .iter()
            .filter(|b| {
                b.crop(frame)
                    .is_some_and(|c| c.pixels().any(|p| p.0[0] != 0))
            })
            .copied()
            .collect()
    }
}

/// Counters shared between a [`ScriptedCamera`] and the test body.
#[derive(Default, Clone)]
pub struct CameraLog {
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
}

impl CameraLog {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// Plays `frames` in order, then repeats the last one forever (or ends the
/// stream if `end_after_script` is set). Optionally trips a cancel token
/// after a given number of reads.
pub struct ScriptedCamera {
    frames: Vec<GrayImage>,
    end_after_script: bool,
    cancel_after: Option<(usize, CancelToken)>,
    fail_open: bool,
    fail_read_at: Option<usize>,
    pub log: CameraLog,
}

impl ScriptedCamera {
    pub fn new(frames: Vec<GrayImage>) -> Self {
        Self {
            frames,
            end_after_script: false,
            cancel_after: None,
            fail_open: false,
            fail_read_at: None,
            log: CameraLog::default(),
        }
    }

    pub fn ending(mut self) -> Self {
        self.end_after_script = true;
        self
    }

    pub fn cancel_after(mut self, reads: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((reads, token));
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_read_at(mut self, read: usize) -> Self {
        self.fail_read_at = Some(read);
        self
    }
}

impl CameraDevice for ScriptedCamera {
    fn open(&self) -> Result<Box<dyn FrameStream>, CaptureError> {
        if self.fail_open {
            return Err(CaptureError::Unavailable("scripted failure".into()));
        }
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedStream {
            frames: self.frames.clone(),
            end_after_script: self.end_after_script,
            cancel_after: self.cancel_after.clone(),
            fail_read_at: self.fail_read_at,
            log: self.log.clone(),
        }))
    }

    fn describe(&self) -> String {
        "scripted camera".into()
    }
}

struct ScriptedStream {
    frames: Vec<GrayImage>,
    end_after_script: bool,
    cancel_after: Option<(usize, CancelToken)>,
    fail_read_at: Option<usize>,
    log: CameraLog,
}

impl FrameStream for ScriptedStream {
    fn read_frame(&mut self) -> Result<Option<GrayImage>, CaptureError> {
        let n = self.log.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_read_at == Some(n) {
            return Err(CaptureError::ReadFailed("scripted failure".into()));
        }
        if let Some((after, token)) = &self.cancel_after {
            if n + 1 >= *after {
                token.cancel();
            }
        }
        let frame = match self.frames.get(n) {
            Some(f) => Some(f.clone()),
            None if self.end_after_script => None,
            None => self.frames.last().cloned(),
        };
        Ok(frame)
    }
}

impl Drop for ScriptedStream {
    fn drop(&mut self) {
        self.log.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records how many frames were shown.
#[derive(Default)]
pub struct CountingPreview {
    pub frames: usize,
    pub faces: usize,
}

impl PreviewSink for CountingPreview {
    fn show(&mut self, _frame: &GrayImage, faces: &[BoundingBox]) {
        self.frames += 1;
        self.faces += faces.len();
    }
}

/// Wraps a store, counting metadata writes and optionally failing sample writes.
pub struct RecordingStore<S> {
    pub inner: S,
    pub metadata_writes: AtomicUsize,
    pub fail_samples: bool,
    log: Mutex<Vec<String>>,
}

impl<S: SampleStore> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            metadata_writes: AtomicUsize::new(0),
            fail_samples: false,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_samples(mut self) -> Self {
        self.fail_samples = true;
        self
    }

    pub fn metadata_writes(&self) -> usize {
        self.metadata_writes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl<S: SampleStore> SampleStore for RecordingStore<S> {
    fn put_sample(&self, key: SampleKey, pixels: &GrayImage) -> Result<SampleKey, StoreError> {
        self.log.lock().unwrap().push(format!("put_sample {key}"));
        if self.fail_samples {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only medium",
            )));
        }
        self.inner.put_sample(key, pixels)
    }

    fn put_metadata(&self, subject: &Subject) -> Result<(), StoreError> {
        self.log.lock().unwrap().push(format!("put_metadata {}", subject.id));
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put_metadata(subject)
    }

    fn list_samples(&self) -> Result<Vec<Sample>, StoreError> {
        self.inner.list_samples()
    }

    fn get_all_metadata(&self) -> Result<BTreeMap<u32, Subject>, StoreError> {
        self.inner.get_all_metadata()
    }

    fn get_sample(&self, key: &SampleKey) -> Result<Option<Sample>, StoreError> {
        self.inner.get_sample(key)
    }

    fn remove_subject(&self, id: u32) -> Result<usize, StoreError> {
        self.inner.remove_subject(id)
    }
}
