//! Local Binary Pattern Histograms (LBPH) face classifier.
//!
//! Every face crop becomes an image of 8-neighbour LBP codes (computed by
//! `imageproc`), which is split into a grid of cells and summarised as the
//! concatenation of the per-cell histograms. Prediction is nearest neighbour
//! under the chi-square distance, so an exact copy of an enrolled crop
//! scores 0.

use image::GrayImage;
use imageproc::local_binary_patterns::local_binary_pattern;
use thiserror::Error;

// OpenCV LBPHFaceRecognizer default grid; the operator is radius 1, 8 neighbours.
const LBPH_GRID_X: u32 = 8;
const LBPH_GRID_Y: u32 = 8;
const LBPH_BINS: usize = 256;
const LBPH_EPSILON: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum LbphError {
    #[error("face crop {width}x{height} is too small (need at least {min_width}x{min_height})")]
    ImageTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    #[error("invalid LBPH parameters: {0}")]
    InvalidParams(String),
    #[error("no training samples")]
    Empty,
}

/// Shape of the histogram grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbphParams {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            grid_x: LBPH_GRID_X,
            grid_y: LBPH_GRID_Y,
        }
    }
}

impl LbphParams {
    fn validate(&self) -> Result<(), LbphError> {
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(LbphError::InvalidParams("grid must be at least 1x1".into()));
        }
        Ok(())
    }

    /// Smallest crop that gives every grid cell at least one LBP code.
    pub fn min_size(&self) -> (u32, u32) {
        (self.grid_x + 2, self.grid_y + 2)
    }
}

/// Nearest enrolled sample for a face crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: u32,
    pub distance: f64,
    /// Position of the nearest sample in training order.
    pub index: usize,
}

/// A trained LBPH model: one spatial histogram per training sample.
pub struct LbphModel {
    params: LbphParams,
    histograms: Vec<Vec<f32>>,
    labels: Vec<u32>,
}

impl LbphModel {
    /// Fit the model over the whole corpus in one batch.
    pub fn train<'a, I>(params: LbphParams, samples: I) -> Result<Self, LbphError>
    where
        I: IntoIterator<Item = (&'a GrayImage, u32)>,
    {
        params.validate()?;
        let mut histograms = Vec::new();
        let mut labels = Vec::new();
        for (image, label) in samples {
            histograms.push(spatial_histogram(image, &params)?);
            labels.push(label);
        }
        if histograms.is_empty() {
            return Err(LbphError::Empty);
        }
        Ok(Self {
            params,
            histograms,
            labels,
        })
    }

    /// Find the closest training sample. Ties go to the earliest sample.
    pub fn predict(&self, face: &GrayImage) -> Result<Option<Prediction>, LbphError> {
        let query = spatial_histogram(face, &self.params)?;
        let mut best: Option<Prediction> = None;
        for (index, (hist, &label)) in self.histograms.iter().zip(&self.labels).enumerate() {
            let distance = chi_square(hist, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label,
                    distance,
                    index,
                });
            }
        }
        Ok(best)
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }
}

/// LBP codes of the interior pixels, row by row.
///
/// The output is `(width - 2) x (height - 2)`; border pixels have no full ring.
fn lbp_codes(image: &GrayImage) -> (Vec<u8>, u32, u32) {
    let out_w = image.width().saturating_sub(2);
    let out_h = image.height().saturating_sub(2);
    let mut codes = Vec::with_capacity(out_w as usize * out_h as usize);
    for y in 1..=out_h {
        for x in 1..=out_w {
            codes.push(local_binary_pattern(image, x, y).unwrap_or(0));
        }
    }
    (codes, out_w, out_h)
}

/// Concatenated per-cell histograms, each normalised by the cell's pixel count.
fn spatial_histogram(image: &GrayImage, params: &LbphParams) -> Result<Vec<f32>, LbphError> {
    let (min_width, min_height) = params.min_size();
    if image.width() < min_width || image.height() < min_height {
        return Err(LbphError::ImageTooSmall {
            width: image.width(),
            height: image.height(),
            min_width,
            min_height,
        });
    }

    let (codes, lbp_w, lbp_h) = lbp_codes(image);
    let cell_w = lbp_w / params.grid_x;
    let cell_h = lbp_h / params.grid_y;
    let bins = LBPH_BINS;
    let cell_pixels = (cell_w * cell_h) as f32;
    let mut hist = vec![0f32; bins * (params.grid_x * params.grid_y) as usize];

    for gy in 0..params.grid_y {
        for gx in 0..params.grid_x {
            let offset = ((gy * params.grid_x + gx) as usize) * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    let code = codes[(y * lbp_w + x) as usize] as usize;
                    hist[offset + code] += 1.0;
                }
            }
            for bin in &mut hist[offset..offset + bins] {
                *bin /= cell_pixels;
            }
        }
    }

    Ok(hist)
}

/// Alternative chi-square distance: `2 * Σ (a - b)² / (a + b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    let mut sum = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let denom = x as f64 + y as f64;
        if denom > LBPH_EPSILON {
            let diff = x as f64 - y as f64;
            sum += diff * diff / denom;
        }
    }
    2.0 * sum
}
