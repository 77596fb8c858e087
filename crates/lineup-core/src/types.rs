use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bounding box of a located face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect the box with a `frame_width` × `frame_height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(BoundingBox::new(self.x, self.y, width, height))
    }

    /// Copy the boxed region out of `frame`, clamped to the frame bounds.
    pub fn crop(&self, frame: &GrayImage) -> Option<GrayImage> {
        let b = self.clamp_to(frame.width(), frame.height())?;
        Some(image::imageops::crop_imm(frame, b.x, b.y, b.width, b.height).to_image())
    }
}

/// An enrolled identity and its descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Caller-chosen, stable, positive identifier.
    pub id: u32,
    pub name: String,
    /// Category shown next to the name (the offence, for a lineup).
    pub label: String,
}

impl Subject {
    pub fn new(id: u32, name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            label: label.into(),
        }
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    /// Cropped from a live camera frame during an acquisition session.
    Camera,
    /// Cropped from an image file supplied by the operator.
    Upload,
}

impl SampleSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleSource::Camera => "camera",
            SampleSource::Upload => "upload",
        }
    }
}

impl fmt::Display for SampleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleSource {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" => Ok(SampleSource::Camera),
            "upload" => Ok(SampleSource::Upload),
            other => Err(ParseKeyError(format!("unknown sample source {other:?}"))),
        }
    }
}

/// Identity of one stored sample.
///
/// Rendered as `<subject_id>-<source>-<sequence>`, e.g. `7-camera-12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey {
    pub subject_id: u32,
    pub source: SampleSource,
    /// Starts at 1 and increases monotonically within a session.
    pub sequence: u32,
}

impl SampleKey {
    pub fn new(subject_id: u32, source: SampleSource, sequence: u32) -> Self {
        Self {
            subject_id,
            source,
            sequence,
        }
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.subject_id, self.source, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid sample key: {0}")]
pub struct ParseKeyError(String);

impl FromStr for SampleKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (Some(id), Some(source), Some(seq), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseKeyError(format!("{s:?} is not <id>-<source>-<sequence>")));
        };
        let subject_id = id
            .parse()
            .map_err(|_| ParseKeyError(format!("bad subject id {id:?}")))?;
        let sequence = seq
            .parse()
            .map_err(|_| ParseKeyError(format!("bad sequence {seq:?}")))?;
        Ok(SampleKey::new(subject_id, source.parse()?, sequence))
    }
}

/// One grayscale face crop tied to a subject.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: SampleKey,
    pub pixels: GrayImage,
}

/// Outcome of one accepted recognition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub subject_id: u32,
    /// Chi-square distance to the nearest enrolled sample. Lower is better.
    pub distance: f64,
    /// `100 - distance`, the figure shown to operators.
    pub confidence: f64,
    /// The enrolled sample that produced the match.
    pub representative: SampleKey,
}

impl MatchResult {
    pub fn new(subject_id: u32, distance: f64, representative: SampleKey) -> Self {
        Self {
            subject_id,
            distance,
            confidence: 100.0 - distance,
            representative,
        }
    }
}
