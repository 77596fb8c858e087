use crate::config::Config;
use image::GrayImage;
use lineup_core::capture::{ExclusiveCamera, StillCamera};
use lineup_core::detector::DetectorError;
use lineup_core::{
    AcquireOutcome, AcquireRequest, CameraDevice, CancelToken, FaceLocator, IngestReport,
    Pipeline, PipelineConfig, PreviewSink, RecognizeOutcome, SampleStore, SessionError, Subject,
};
#[cfg(not(feature = "opencv"))]
use lineup_core::{CascadeLocator, HaarCascade};
use lineup_hw::DeviceCamera;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face locator error: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Messages sent from the command handlers to the engine thread.
enum EngineRequest {
    Enroll {
        request: AcquireRequest,
        cancel: CancelToken,
        preview: Box<dyn PreviewSink>,
        reply: Reply<AcquireOutcome>,
    },
    Upload {
        subject: Subject,
        uploads: Vec<(String, GrayImage)>,
        reply: Reply<IngestReport>,
    },
    Recognize {
        /// Still frames to search instead of the live camera.
        stills: Option<Vec<GrayImage>>,
        cancel: CancelToken,
        preview: Box<dyn PreviewSink>,
        reply: Reply<RecognizeOutcome>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Capture face crops for `request.subject` until the quota or cancellation.
    pub async fn enroll(
        &self,
        request: AcquireRequest,
        cancel: CancelToken,
        preview: Box<dyn PreviewSink>,
    ) -> Result<AcquireOutcome, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            request,
            cancel,
            preview,
            reply,
        })
        .await
    }

    /// Store the faces found in already-decoded images.
    pub async fn upload(
        &self,
        subject: Subject,
        uploads: Vec<(String, GrayImage)>,
    ) -> Result<IngestReport, EngineError> {
        self.call(|reply| EngineRequest::Upload {
            subject,
            uploads,
            reply,
        })
        .await
    }

    /// Retrain, then search the camera (or `stills`) for an enrolled face.
    pub async fn recognize(
        &self,
        stills: Option<Vec<GrayImage>>,
        cancel: CancelToken,
        preview: Box<dyn PreviewSink>,
    ) -> Result<RecognizeOutcome, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            stills,
            cancel,
            preview,
            reply,
        })
        .await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the cascade up front so a bad path fails before any request is
/// queued. The camera itself is opened per session and released when the
/// session ends. Requests run one at a time.
pub fn spawn_engine(
    config: &Config,
    store: Arc<dyn SampleStore>,
) -> Result<EngineHandle, EngineError> {
    let locator = load_locator(config)?;

    let camera = ExclusiveCamera::new(DeviceCamera::new(
        config.camera_device.clone(),
        config.camera_width,
        config.camera_height,
    ));
    let pipeline_config = config.pipeline_config();

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("lineup-engine".into())
        .spawn(move || {
            tracing::info!(camera = %camera.describe(), "engine thread started");
            let live = Pipeline::new(&camera, &locator, store.clone(), pipeline_config.clone());
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        request,
                        cancel,
                        mut preview,
                        reply,
                    } => {
                        let result = live.acquire_samples(&request, &cancel, preview.as_mut());
                        let _ = reply.send(result);
                    }
                    EngineRequest::Upload {
                        subject,
                        uploads,
                        reply,
                    } => {
                        let _ = reply.send(live.ingest_upload(&subject, &uploads));
                    }
                    EngineRequest::Recognize {
                        stills: None,
                        cancel,
                        mut preview,
                        reply,
                    } => {
                        let _ = reply.send(live.recognize(&cancel, preview.as_mut()));
                    }
                    EngineRequest::Recognize {
                        stills: Some(frames),
                        cancel,
                        mut preview,
                        reply,
                    } => {
                        let result = run_still(
                            frames,
                            &locator,
                            store.clone(),
                            &pipeline_config,
                            &cancel,
                            preview.as_mut(),
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(not(feature = "opencv"))]
fn load_locator(config: &Config) -> Result<CascadeLocator, EngineError> {
    let cascade = HaarCascade::load(&config.cascade_path)?;
    let (window_w, window_h) = cascade.window();
    tracing::info!(
        path = %config.cascade_path.display(),
        window_w,
        window_h,
        "Haar cascade loaded"
    );
    Ok(CascadeLocator::new(cascade, config.detect_params())?)
}

#[cfg(feature = "opencv")]
fn load_locator(config: &Config) -> Result<lineup_core::OpencvLocator, EngineError> {
    Ok(lineup_core::OpencvLocator::load(
        &config.cascade_path,
        config.detect_params(),
    )?)
}

/// Recognise against still images: no pacing, and running out of images
/// without a match is reported as an abort rather than an error. Stills are
/// mirrored like camera frames so they share the enrolled orientation.
fn run_still(
    frames: Vec<GrayImage>,
    locator: &dyn FaceLocator,
    store: Arc<dyn SampleStore>,
    config: &PipelineConfig,
    cancel: &CancelToken,
    preview: &mut dyn PreviewSink,
) -> Result<RecognizeOutcome, SessionError> {
    let config = PipelineConfig {
        tick_interval: std::time::Duration::ZERO,
        ..config.clone()
    };
    let pipeline = Pipeline::new(StillCamera::new(frames), locator, store, config);
    match pipeline.recognize(cancel, preview) {
        Err(SessionError::StreamEnded) => {
            tracing::info!("recognize: no enrolled face in the given images");
            Ok(RecognizeOutcome::Aborted)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineup_core::capture::NoPreview;
    use lineup_core::{BoundingBox, MemoryStore};

    const SIDE: u32 = 32;

    /// Reports whichever of the two frame halves is not black.
    struct NonBlankHalf;

    impl FaceLocator for NonBlankHalf {
        fn locate(&self, frame: &GrayImage) -> Vec<BoundingBox> {
            [0, SIDE]
                .into_iter()
                .map(|x| BoundingBox::new(x, 0, SIDE, SIDE))
                .filter(|b| b.crop(frame).is_some_and(|c| c.pixels().any(|p| p.0[0] != 0)))
                .collect()
        }
    }

    /// Vertical stripes in the left half, black on the right.
    fn left_face() -> GrayImage {
        GrayImage::from_fn(2 * SIDE, SIDE, |x, _| {
            image::Luma([if x >= SIDE { 0 } else if (x / 3) % 2 == 0 { 40 } else { 210 }])
        })
    }

    fn config(mirror: bool) -> PipelineConfig {
        PipelineConfig {
            mirror,
            tick_interval: std::time::Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn test_still_matches_mirrored_upload_exactly() {
        let store = Arc::new(MemoryStore::new());
        let uploader = Pipeline::new(StillCamera::new(vec![]), NonBlankHalf, store.clone(), config(true));
        uploader
            .ingest_upload(&Subject::new(4, "Dana", "theft"), &[("a.png".into(), left_face())])
            .unwrap();

        let outcome = run_still(
            vec![left_face()],
            &NonBlankHalf,
            store.clone(),
            &config(true),
            &CancelToken::new(),
            &mut NoPreview,
        )
        .unwrap();

        let RecognizeOutcome::Matched(id) = outcome else {
            panic!("expected a match, got {outcome:?}");
        };
        assert_eq!(id.result.subject_id, 4);
        assert!(id.result.distance.abs() < 1e-9);
    }

    #[test]
    fn test_still_without_faces_aborts() {
        let store = Arc::new(MemoryStore::new());
        let uploader = Pipeline::new(StillCamera::new(vec![]), NonBlankHalf, store.clone(), config(false));
        uploader
            .ingest_upload(&Subject::new(4, "Dana", "theft"), &[("a.png".into(), left_face())])
            .unwrap();

        let outcome = run_still(
            vec![GrayImage::new(2 * SIDE, SIDE)],
            &NonBlankHalf,
            store,
            &config(false),
            &CancelToken::new(),
            &mut NoPreview,
        )
        .unwrap();
        assert!(matches!(outcome, RecognizeOutcome::Aborted));
    }
}
