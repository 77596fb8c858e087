//! The enrollment and recognition pipeline: a camera, a face locator and a
//! sample store, plus the tunables shared by every session.
//!
//! Session operations live next to their logic:
//! [`acquire_samples`](Pipeline::acquire_samples) and
//! [`ingest_upload`](Pipeline::ingest_upload) in `enroll`,
//! [`recognize`](Pipeline::recognize) in `recognize`.

use crate::capture::{CameraDevice, FrameStream};
use crate::detector::FaceLocator;
use crate::error::SessionError;
use crate::lbph::LbphParams;
use crate::store::SampleStore;
use crate::trainer::{self, TrainedModel};
use image::GrayImage;
use std::sync::Arc;
use std::time::Duration;

/// Distances at or above this are never accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 100.0;
/// Pause between session ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub match_threshold: f64,
    pub tick_interval: Duration,
    /// Flip camera frames horizontally so the preview behaves like a mirror.
    pub mirror: bool,
    pub lbph: LbphParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            tick_interval: DEFAULT_TICK_INTERVAL,
            mirror: false,
            lbph: LbphParams::default(),
        }
    }
}

pub struct Pipeline<C, L, S: ?Sized> {
    pub(crate) camera: C,
    pub(crate) locator: L,
    pub(crate) store: Arc<S>,
    pub(crate) config: PipelineConfig,
}

impl<C, L, S> Pipeline<C, L, S>
where
    C: CameraDevice,
    L: FaceLocator,
    S: SampleStore + ?Sized,
{
    pub fn new(camera: C, locator: L, store: Arc<S>, config: PipelineConfig) -> Self {
        Self {
            camera,
            locator,
            store,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build a fresh classifier over everything currently enrolled.
    pub fn train(&self) -> Result<TrainedModel, SessionError> {
        trainer::train(self.store.as_ref(), self.config.lbph)
    }

    pub(crate) fn open_camera(&self) -> Result<Box<dyn FrameStream>, SessionError> {
        let stream = self
            .camera
            .open()
            .map_err(SessionError::DeviceUnavailable)?;
        tracing::debug!(camera = %self.camera.describe(), "camera acquired");
        Ok(stream)
    }

    /// Read one frame, mirrored if configured. End of stream is an error:
    /// sessions only end by reaching their goal or by cancellation.
    pub(crate) fn next_frame(&self, stream: &mut dyn FrameStream) -> Result<GrayImage, SessionError> {
        let frame = stream
            .read_frame()
            .map_err(SessionError::Capture)?
            .ok_or(SessionError::StreamEnded)?;
        if self.config.mirror {
            Ok(image::imageops::flip_horizontal(&frame))
        } else {
            Ok(frame)
        }
    }

    pub(crate) fn pause(&self) {
        if !self.config.tick_interval.is_zero() {
            std::thread::sleep(self.config.tick_interval);
        }
    }
}
