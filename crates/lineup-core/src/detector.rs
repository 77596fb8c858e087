//! Haar cascade face locator.
//!
//! Reads OpenCV's boosted-cascade XML format (the format of
//! `haarcascade_frontalface_default.xml`) and runs the Viola-Jones detector
//! over an image pyramid, then merges neighbouring hits the way OpenCV's
//! `groupRectangles` does.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// --- Baseline detector configuration ---
const HAAR_SCALE_FACTOR: f64 = 1.3;
const HAAR_MIN_NEIGHBORS: u32 = 5;
const HAAR_GROUP_EPS: f64 = 0.2;
/// Windows searched at scales above this use a one-pixel step instead of two.
const HAAR_FINE_STEP_SCALE: f64 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
    #[error("invalid cascade: {0}")]
    Invalid(String),
    #[error("invalid detection parameters: {0}")]
    InvalidParams(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    Opencv(#[from] opencv::Error),
}

/// Finds candidate faces in a frame.
///
/// Implementations are pure: the same frame always yields the same boxes, in
/// the same order. Results may overlap and may be empty.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox>;
}

impl<T: FaceLocator + ?Sized> FaceLocator for &T {
    fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox> {
        (**self).locate(frame)
    }
}

/// Multi-scale search tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Pyramid step between scales. Must be greater than 1.
    pub scale_factor: f64,
    /// A group needs more than this many raw hits to be reported.
    pub min_neighbors: u32,
    /// Smallest face reported; defaults to the cascade window.
    pub min_size: Option<(u32, u32)>,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: HAAR_SCALE_FACTOR,
            min_neighbors: HAAR_MIN_NEIGHBORS,
            min_size: None,
        }
    }
}

impl DetectParams {
    pub(crate) fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be greater than 1, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

// --- XML schema (only the parts the detector needs) ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeXml {
    #[serde(default)]
    stage_type: Option<String>,
    #[serde(default)]
    feature_type: Option<String>,
    height: String,
    width: String,
    stages: ListXml<StageXml>,
    features: ListXml<FeatureXml>,
}

#[derive(Deserialize)]
struct ListXml<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageXml {
    stage_threshold: String,
    weak_classifiers: ListXml<WeakXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeakXml {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: ListXml<String>,
    #[serde(default)]
    tilted: Option<String>,
}

// --- Runtime cascade ---

#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
    nodes: Vec<Node>,
    leaves: Vec<f32>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug, Clone)]
struct Feature {
    rects: Vec<WeightedRect>,
}

/// A boosted Haar cascade with its training window size.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<Feature>,
}

impl HaarCascade {
    /// Load a cascade from an OpenCV XML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DetectorError::CascadeNotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            window = ?cascade.window(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from OpenCV XML text.
    pub fn from_xml(xml: &str) -> Result<Self, DetectorError> {
        let doc: StorageXml = quick_xml::de::from_str(xml)?;
        let c = doc.cascade;

        if let Some(stage_type) = c.stage_type.as_deref().map(str::trim) {
            if stage_type != "BOOST" {
                return Err(DetectorError::Unsupported(format!("stage type {stage_type}")));
            }
        }
        if let Some(feature_type) = c.feature_type.as_deref().map(str::trim) {
            if feature_type != "HAAR" {
                return Err(DetectorError::Unsupported(format!("feature type {feature_type}")));
            }
        }

        let window_width: u32 = parse_num("width", &c.width)?;
        let window_height: u32 = parse_num("height", &c.height)?;
        if window_width < 3 || window_height < 3 {
            return Err(DetectorError::Invalid(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = c
            .features
            .items
            .iter()
            .map(|f| parse_feature(f, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stages = Vec::with_capacity(c.stages.items.len());
        for stage in &c.stages.items {
            let classifiers = stage
                .weak_classifiers
                .items
                .iter()
                .map(|w| parse_weak(w, features.len()))
                .collect::<Result<Vec<_>, _>>()?;
            stages.push(Stage {
                threshold: parse_num("stageThreshold", &stage.stage_threshold)?,
                classifiers,
            });
        }
        if stages.is_empty() {
            return Err(DetectorError::Invalid("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Training window size `(width, height)`.
    pub fn window(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Run the detector over `frame`. Boxes are returned in group order.
    pub fn detect(&self, frame: &GrayImage, params: &DetectParams) -> Vec<BoundingBox> {
        let (img_w, img_h) = frame.dimensions();
        let (min_w, min_h) = params
            .min_size
            .unwrap_or((self.window_width, self.window_height));
        let mut hits = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let win_w = (self.window_width as f64 * factor).round() as u32;
            let win_h = (self.window_height as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < self.window_width || scaled_h < self.window_height {
                break;
            }

            if win_w >= min_w && win_h >= min_h {
                let scaled = if factor == 1.0 {
                    frame.clone()
                } else {
                    image::imageops::resize(frame, scaled_w, scaled_h, FilterType::Triangle)
                };
                let integral = IntegralImage::new(&scaled);
                let step = if factor > HAAR_FINE_STEP_SCALE { 1 } else { 2 };

                for y in (0..=scaled_h - self.window_height).step_by(step) {
                    for x in (0..=scaled_w - self.window_width).step_by(step) {
                        if self.evaluate_window(&integral, x, y) {
                            hits.push(BoundingBox::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                win_w,
                                win_h,
                            ));
                        }
                    }
                }
            }

            factor *= params.scale_factor;
        }

        tracing::trace!(raw = hits.len(), "cascade raw hits");
        group_rectangles(&hits, params.min_neighbors, HAAR_GROUP_EPS)
    }

    /// True when the window at `(x, y)` passes every stage.
    fn evaluate_window(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        // Variance normalisation over the window shrunk by one pixel per side.
        let (nx, ny) = (x + 1, y + 1);
        let (nw, nh) = (self.window_width - 2, self.window_height - 2);
        let area = (nw * nh) as f64;
        let sum = integral.sum(nx, ny, nw, nh) as f64;
        let sq_sum = integral.sq_sum(nx, ny, nw, nh);
        let variance = area * sq_sum - sum * sum;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0f32;
            for weak in &stage.classifiers {
                stage_sum += self.evaluate_weak(weak, integral, x, y, norm);
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }

    fn evaluate_weak(
        &self,
        weak: &WeakClassifier,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        norm: f64,
    ) -> f32 {
        let mut idx = 0usize;
        loop {
            let node = weak.nodes[idx];
            let value: f64 = self.features[node.feature]
                .rects
                .iter()
                .map(|r| r.weight as f64 * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
                .sum();
            let next = if value < node.threshold as f64 * norm {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return weak.leaves[next.unsigned_abs() as usize];
            }
            idx = next as usize;
        }
    }
}

/// [`HaarCascade`] bound to fixed detection parameters.
pub struct CascadeLocator {
    cascade: HaarCascade,
    params: DetectParams,
}

impl CascadeLocator {
    pub fn new(cascade: HaarCascade, params: DetectParams) -> Result<Self, DetectorError> {
        params.validate()?;
        Ok(Self { cascade, params })
    }
}

impl FaceLocator for CascadeLocator {
    fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox> {
        self.cascade.detect(frame, &self.params)
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, text: &str) -> Result<T, DetectorError> {
    text.trim()
        .parse()
        .map_err(|_| DetectorError::Invalid(format!("{field}: cannot parse {:?}", text.trim())))
}

fn parse_feature(f: &FeatureXml, window_w: u32, window_h: u32) -> Result<Feature, DetectorError> {
    if f.tilted.as_deref().map(str::trim).is_some_and(|t| t != "0") {
        return Err(DetectorError::Unsupported("tilted Haar features".into()));
    }
    let mut rects = Vec::with_capacity(f.rects.items.len());
    for text in &f.rects.items {
        let parts: Vec<&str> = text.split_whitespace().collect();
        let [x, y, w, h, weight] = parts.as_slice() else {
            return Err(DetectorError::Invalid(format!("feature rect {text:?}")));
        };
        let rect = WeightedRect {
            x: parse_num("rect x", x)?,
            y: parse_num("rect y", y)?,
            width: parse_num("rect width", w)?,
            height: parse_num("rect height", h)?,
            weight: parse_num("rect weight", weight)?,
        };
        let right = rect.x.checked_add(rect.width);
        let bottom = rect.y.checked_add(rect.height);
        if right.map_or(true, |r| r > window_w) || bottom.map_or(true, |b| b > window_h) {
            return Err(DetectorError::Invalid(format!(
                "feature rect {text:?} exceeds the {window_w}x{window_h} window"
            )));
        }
        rects.push(rect);
    }
    if rects.is_empty() {
        return Err(DetectorError::Invalid("feature without rects".into()));
    }
    Ok(Feature { rects })
}

fn parse_weak(w: &WeakXml, feature_count: usize) -> Result<WeakClassifier, DetectorError> {
    let raw: Vec<&str> = w.internal_nodes.split_whitespace().collect();
    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(DetectorError::Invalid(format!(
            "internalNodes needs groups of 4 values, got {}",
            raw.len()
        )));
    }
    let leaves = w
        .leaf_values
        .split_whitespace()
        .map(|v| parse_num("leafValues", v))
        .collect::<Result<Vec<f32>, _>>()?;

    let mut nodes = Vec::with_capacity(raw.len() / 4);
    for chunk in raw.chunks(4) {
        let node = Node {
            left: parse_num("internalNodes", chunk[0])?,
            right: parse_num("internalNodes", chunk[1])?,
            feature: parse_num("internalNodes", chunk[2])?,
            threshold: parse_num("internalNodes", chunk[3])?,
        };
        if node.feature >= feature_count {
            return Err(DetectorError::Invalid(format!(
                "feature index {} out of range ({feature_count} features)",
                node.feature
            )));
        }
        nodes.push(node);
    }

    // Every branch must land on a leaf or on a later node, so evaluation
    // always terminates.
    for (current, node) in nodes.iter().enumerate() {
        for next in [node.left, node.right] {
            let ok = if next <= 0 {
                (next.unsigned_abs() as usize) < leaves.len()
            } else {
                let next = next as usize;
                next > current && next < nodes.len()
            };
            if !ok {
                return Err(DetectorError::Invalid(format!(
                    "branch {next} from node {current} is dangling or loops back"
                )));
            }
        }
    }

    Ok(WeakClassifier { nodes, leaves })
}

/// Summed-area tables of pixel values and squared pixel values.
///
/// Both tables are `(width + 1) x (height + 1)` with a zero first row and
/// column, as `imageproc` builds them.
struct IntegralImage {
    sum: ImageBuffer<Luma<u64>, Vec<u64>>,
    sq_sum: ImageBuffer<Luma<u64>, Vec<u64>>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(image),
            sq_sum: integral_squared_image::<_, u64>(image),
        }
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        rect_sum(&self.sum, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        rect_sum(&self.sq_sum, x, y, w, h) as f64
    }
}

fn rect_sum(table: &ImageBuffer<Luma<u64>, Vec<u64>>, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |x: u32, y: u32| table.get_pixel(x, y).0[0];
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

/// Two boxes belong to the same group when every edge is within `eps` of
/// the smaller box's mean side.
fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) + a.height.min(b.height)) as f64 * 0.5;
    let (ax, ay, bx, by) = (a.x as f64, a.y as f64, b.x as f64, b.y as f64);
    (ax - bx).abs() <= delta
        && (ay - by).abs() <= delta
        && ((ax + a.width as f64) - (bx + b.width as f64)).abs() <= delta
        && ((ay + a.height as f64) - (by + b.height as f64)).abs() <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster raw hits, average each cluster and drop weak or nested clusters.
///
/// A cluster survives when it has more than `min_neighbors` members and is not
/// contained in a stronger cluster. With `min_neighbors == 0` the hits are
/// returned untouched.
fn group_rectangles(rects: &[BoundingBox], min_neighbors: u32, eps: f64) -> Vec<BoundingBox> {
    if min_neighbors == 0 || rects.is_empty() {
        return rects.to_vec();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Number clusters in order of first appearance.
    let mut class_of_root = vec![usize::MAX; n];
    let mut sums: Vec<[f64; 4]> = Vec::new();
    let mut counts: Vec<u32> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = sums.len();
            sums.push([0.0; 4]);
            counts.push(0);
        }
        let c = class_of_root[root];
        sums[c][0] += r.x as f64;
        sums[c][1] += r.y as f64;
        sums[c][2] += r.width as f64;
        sums[c][3] += r.height as f64;
        counts[c] += 1;
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(&counts)
        .map(|(s, &count)| {
            let k = count as f64;
            BoundingBox::new(
                (s[0] / k).round() as u32,
                (s[1] / k).round() as u32,
                (s[2] / k).round() as u32,
                (s[3] / k).round() as u32,
            )
        })
        .collect();

    let mut out = Vec::new();
    'outer: for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        for (j, r2) in averaged.iter().enumerate() {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                continue;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = (r1.x as i64, r1.y as i64, r1.width as i64, r1.height as i64);
            let (x2, y2, w2, h2) = (r2.x as i64, r2.y as i64, r2.width as i64, r2.height as i64);
            let inside = x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy;
            if inside && (n2 > n1.max(3) || n1 < 3) {
                continue 'outer;
            }
        }
        out.push(*r1);
    }
    out
}
