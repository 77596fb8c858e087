//! Face location through OpenCV's `CascadeClassifier` (feature `opencv`).
//!
//! Same cascade files and [`DetectParams`] as [`crate::CascadeLocator`], but
//! the multi-scale search and grouping run inside OpenCV.

use crate::detector::{DetectParams, DetectorError, FaceLocator};
use crate::types::BoundingBox;
use image::GrayImage;
use opencv::core::{Mat, Rect, Size, Vector};
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub struct OpencvLocator {
    // detect_multi_scale needs `&mut self`.
    classifier: Mutex<CascadeClassifier>,
    params: DetectParams,
}

impl OpencvLocator {
    pub fn load(path: impl AsRef<Path>, params: DetectParams) -> Result<Self, DetectorError> {
        params.validate()?;
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(path.display().to_string()));
        }
        let classifier = CascadeClassifier::new(&path.to_string_lossy())?;
        if classifier.empty()? {
            return Err(DetectorError::Invalid(format!(
                "OpenCV could not load {}",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), "loaded OpenCV cascade");
        Ok(Self {
            classifier: Mutex::new(classifier),
            params,
        })
    }

    fn detect(&self, frame: &GrayImage) -> opencv::Result<Vec<BoundingBox>> {
        let mat = Mat::new_rows_cols_with_data(
            frame.height() as i32,
            frame.width() as i32,
            frame.as_raw().as_slice(),
        )?;
        let min_size = self
            .params
            .min_size
            .map_or(Size::new(0, 0), |(w, h)| Size::new(w as i32, h as i32));

        let mut faces: Vector<Rect> = Vector::new();
        let mut classifier = self.classifier.lock().unwrap_or_else(PoisonError::into_inner);
        classifier.detect_multi_scale(
            &*mat,
            &mut faces,
            self.params.scale_factor,
            self.params.min_neighbors as i32,
            0,
            min_size,
            Size::new(0, 0),
        )?;

        Ok(faces
            .iter()
            .map(|r| {
                BoundingBox::new(
                    r.x.max(0) as u32,
                    r.y.max(0) as u32,
                    r.width.max(0) as u32,
                    r.height.max(0) as u32,
                )
            })
            .collect())
    }
}

impl FaceLocator for OpencvLocator {
    fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox> {
        match self.detect(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "OpenCV face location failed");
                Vec::new()
            }
        }
    }
}
