use crate::capture::CaptureError;
use crate::lbph::LbphError;
use crate::store::StoreError;
use thiserror::Error;

/// Failure of an acquisition, training or recognition session.
///
/// Sessions never retry. By the time one of these reaches the caller the
/// camera has already been released.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("no enrolled samples to train on")]
    EmptyCorpus,
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(#[source] CaptureError),
    #[error("frame capture failed: {0}")]
    Capture(#[source] CaptureError),
    #[error("camera stream ended before the session finished")]
    StreamEnded,
    #[error("internal consistency error: {0}")]
    InternalConsistency(String),
    #[error("classifier error: {0}")]
    Classifier(#[from] LbphError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no face detected in any uploaded image")]
    NoFaceDetected,
}
