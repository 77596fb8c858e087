//! lineup-core: face enrollment and recognition sessions.
//!
//! Faces are located with a Haar cascade (evaluated in-crate, or by OpenCV
//! with the `opencv` feature) and identified with a local binary
//! pattern histogram (LBPH) classifier that is retrained from the sample
//! store before every recognition run.

pub mod capture;
pub mod detector;
pub mod enroll;
pub mod error;
pub mod lbph;
#[cfg(feature = "opencv")]
pub mod opencv_locator;
pub mod pipeline;
pub mod recognize;
pub mod store;
pub mod trainer;
pub mod types;

#[cfg(test)]
mod testing;

pub use capture::{CameraDevice, CancelToken, CaptureError, FrameStream, PreviewSink};
pub use detector::{CascadeLocator, DetectParams, FaceLocator, HaarCascade};
pub use enroll::{AcquireOutcome, AcquireRequest, IngestReport};
pub use error::SessionError;
pub use pipeline::{Pipeline, PipelineConfig};
pub use recognize::{Identification, RecognizeOutcome};
pub use store::{MemoryStore, SampleStore, StoreError};
pub use types::{BoundingBox, MatchResult, Sample, SampleKey, SampleSource, Subject};

#[cfg(feature = "opencv")]
pub use opencv_locator::OpencvLocator;
