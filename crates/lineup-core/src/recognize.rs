//! Recognition Loop: retrain, then watch the camera until a face matches an
//! enrolled subject or the operator cancels.

use crate::capture::{CameraDevice, CancelToken, PreviewSink};
use crate::detector::FaceLocator;
use crate::error::SessionError;
use crate::lbph::LbphError;
use crate::pipeline::Pipeline;
use crate::store::SampleStore;
use crate::trainer::TrainedModel;
use crate::types::{BoundingBox, MatchResult, Subject};
use image::GrayImage;
use serde::Serialize;

/// An accepted match plus the subject's metadata, if any was recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub result: MatchResult,
    pub subject: Option<Subject>,
}

/// Terminal state of a recognition session.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizeOutcome {
    Matched(Identification),
    Aborted,
}

/// A distance is accepted only when strictly below the threshold.
pub fn accepts(distance: f64, threshold: f64) -> bool {
    distance < threshold
}

/// Classify `faces` in locator order and return the first accepted match.
pub fn first_match(
    model: &TrainedModel,
    frame: &GrayImage,
    faces: &[BoundingBox],
    threshold: f64,
) -> Result<Option<MatchResult>, SessionError> {
    for face in faces {
        let Some(crop) = face.crop(frame) else {
            continue;
        };
        let prediction = match model.predict(&crop) {
            Ok(Some(p)) => p,
            Ok(None) => continue,
            Err(LbphError::ImageTooSmall { width, height, .. }) => {
                tracing::debug!(width, height, "recognize: face too small to classify");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if !accepts(prediction.distance, threshold) {
            tracing::debug!(
                subject = prediction.label,
                distance = prediction.distance,
                threshold,
                "recognize: rejected"
            );
            continue;
        }

        let key = model.representative(prediction.index).ok_or_else(|| {
            SessionError::InternalConsistency(format!(
                "model reported sample #{} but holds {}",
                prediction.index,
                model.sample_count()
            ))
        })?;
        if key.subject_id != prediction.label {
            return Err(SessionError::InternalConsistency(format!(
                "sample {key} is labelled {} in the model",
                prediction.label
            )));
        }
        return Ok(Some(MatchResult::new(
            prediction.label,
            prediction.distance,
            key.clone(),
        )));
    }
    Ok(None)
}

impl<C, L, S> Pipeline<C, L, S>
where
    C: CameraDevice,
    L: FaceLocator,
    S: SampleStore + ?Sized,
{
    /// Run one recognition session.
    ///
    /// Trains a fresh model first; a training failure is returned before the
    /// camera is opened. Each tick classifies the located faces in order and
    /// stops at the first one whose distance is below the match threshold.
    pub fn recognize(
        &self,
        cancel: &CancelToken,
        preview: &mut dyn PreviewSink,
    ) -> Result<RecognizeOutcome, SessionError> {
        let model = self.train()?;
        let threshold = self.config.match_threshold;

        let mut stream = self.open_camera()?;
        tracing::info!(
            samples = model.sample_count(),
            threshold,
            "recognize: running"
        );

        let mut ticks = 0u64;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(ticks, "recognize: aborted");
                return Ok(RecognizeOutcome::Aborted);
            }

            let frame = self.next_frame(stream.as_mut())?;
            ticks += 1;
            let faces = self.locator.locate(&frame);
            preview.show(&frame, &faces);

            if let Some(result) = first_match(&model, &frame, &faces, threshold)? {
                drop(stream);
                tracing::info!(
                    subject = result.subject_id,
                    distance = result.distance,
                    confidence = result.confidence,
                    representative = %result.representative,
                    ticks,
                    "recognize: matched"
                );
                let subject = self.store.get_subject(result.subject_id)?;
                return Ok(RecognizeOutcome::Matched(Identification { result, subject }));
            }
            self.pause();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::NoPreview;
    use crate::enroll::AcquireRequest;
    use crate::lbph::LbphParams;
    use crate::pipeline::PipelineConfig;
    use crate::store::MemoryStore;
    use crate::testing::*;
    use crate::trainer;
    use crate::types::{SampleKey, SampleSource};
    use std::sync::Arc;
    use std::time::Duration;

    const SPOT: (u32, u32) = (20, 30);

    fn config() -> PipelineConfig {
        PipelineConfig {
            tick_interval: Duration::ZERO,
            ..PipelineConfig::default()
        }
    }

    fn enroll(store: &Arc<MemoryStore>, subject: Subject, face: &GrayImage) {
        let camera = ScriptedCamera::new(vec![frame_with(face, &[SPOT])]);
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());
        pipeline
            .acquire_samples(&AcquireRequest::new(subject), &CancelToken::new(), &mut NoPreview)
            .unwrap();
    }

    fn bob_face() -> GrayImage {
        stripes(FACE_SIZE, 4)
    }

    fn cleo_face() -> GrayImage {
        checker(FACE_SIZE, 3)
    }

    #[test]
    fn test_accepts_is_strict() {
        assert!(accepts(0.0, 100.0));
        assert!(accepts(99.999, 100.0));
        assert!(!accepts(100.0, 100.0));
        assert!(!accepts(100.001, 100.0));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());
        let model = trainer::train(store.as_ref(), LbphParams::default()).unwrap();

        let exact = frame_with(&bob_face(), &[SPOT]);
        let near = frame_with(&stripes(FACE_SIZE, 5), &[SPOT]);
        let faces = FixedLocator::at(&[SPOT]).locate(&exact);

        let d1 = first_match(&model, &exact, &faces, f64::INFINITY).unwrap().unwrap().distance;
        let d2 = first_match(&model, &near, &faces, f64::INFINITY).unwrap().unwrap().distance;
        assert!(d1 < d2, "exact copy should be closer: {d1} vs {d2}");

        // Both accepted under a threshold above both distances.
        let loose = d2 + 1.0;
        assert!(first_match(&model, &exact, &faces, loose).unwrap().is_some());
        assert!(first_match(&model, &near, &faces, loose).unwrap().is_some());

        // A distance equal to the threshold is never accepted.
        assert!(first_match(&model, &near, &faces, d2).unwrap().is_none());
        assert!(first_match(&model, &exact, &faces, d2).unwrap().is_some());
    }

    #[test]
    fn test_first_accepted_face_wins() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());
        enroll(&store, Subject::new(2, "Cleo", "arson"), &cleo_face());
        let model = trainer::train(store.as_ref(), LbphParams::default()).unwrap();

        let mut frame = frame_with(&cleo_face(), &[(0, 0)]);
        image::imageops::replace(&mut frame, &bob_face(), 50, 50);

        let cleo_first = [
            BoundingBox::new(0, 0, FACE_SIZE, FACE_SIZE),
            BoundingBox::new(50, 50, FACE_SIZE, FACE_SIZE),
        ];
        let m = first_match(&model, &frame, &cleo_first, 100.0).unwrap().unwrap();
        assert_eq!(m.subject_id, 2);

        let bob_first = [cleo_first[1], cleo_first[0]];
        let m = first_match(&model, &frame, &bob_first, 100.0).unwrap().unwrap();
        assert_eq!(m.subject_id, 1);
    }

    #[test]
    fn test_tiny_faces_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());
        let model = trainer::train(store.as_ref(), LbphParams::default()).unwrap();
        let frame = frame_with(&bob_face(), &[SPOT]);
        let faces = [
            BoundingBox::new(SPOT.0, SPOT.1, 4, 4),
            BoundingBox::new(SPOT.0, SPOT.1, FACE_SIZE, FACE_SIZE),
        ];
        let m = first_match(&model, &frame, &faces, 100.0).unwrap().unwrap();
        assert_eq!(m.subject_id, 1);
    }

    // Enroll Alice (7) with 30 crops of one pattern and recognise that pattern.
    #[test]
    fn test_scenario_enroll_then_match() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(7, "Alice", "fraud"), &bob_face());

        let model = trainer::train(store.as_ref(), LbphParams::default()).unwrap();
        assert_eq!(model.sample_count(), 30);

        let camera = ScriptedCamera::new(vec![blank_frame(), frame_with(&bob_face(), &[SPOT])]);
        let log = camera.log.clone();
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());

        let outcome = pipeline.recognize(&CancelToken::new(), &mut NoPreview).unwrap();
        let RecognizeOutcome::Matched(id) = outcome else {
            panic!("expected a match, got {outcome:?}");
        };
        assert_eq!(id.result.subject_id, 7);
        assert!(id.result.distance.abs() < 1e-9);
        assert!((id.result.confidence - 100.0).abs() < 1e-9);
        let rep = &id.result.representative;
        assert_eq!((rep.subject_id, rep.source), (7, SampleSource::Camera));
        assert!((1..=30).contains(&rep.sequence));
        assert_eq!(id.subject, Some(Subject::new(7, "Alice", "fraud")));
        assert_eq!(log.reads(), 2);
        assert_eq!((log.opened(), log.released()), (1, 1));
    }

    // No face for a few ticks, then the operator cancels.
    #[test]
    fn test_scenario_cancel_without_match() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(7, "Alice", "fraud"), &bob_face());

        let cancel = CancelToken::new();
        let camera = ScriptedCamera::new(vec![blank_frame()]).cancel_after(5, cancel.clone());
        let log = camera.log.clone();
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());
        let mut preview = CountingPreview::default();

        let outcome = pipeline.recognize(&cancel, &mut preview).unwrap();
        assert_eq!(outcome, RecognizeOutcome::Aborted);
        assert_eq!(log.reads(), 5);
        assert_eq!(preview.frames, 5);
        assert_eq!(preview.faces, 0);
        assert_eq!((log.opened(), log.released()), (1, 1));
    }

    // Training before any enrollment fails and never touches the camera.
    #[test]
    fn test_scenario_empty_store_never_opens_camera() {
        let camera = ScriptedCamera::new(vec![frame_with(&bob_face(), &[SPOT])]);
        let log = camera.log.clone();
        let pipeline = Pipeline::new(
            camera,
            FixedLocator::at(&[SPOT]),
            Arc::new(MemoryStore::new()),
            config(),
        );

        assert!(matches!(pipeline.train(), Err(SessionError::EmptyCorpus)));
        let err = pipeline.recognize(&CancelToken::new(), &mut NoPreview).unwrap_err();
        assert!(matches!(err, SessionError::EmptyCorpus));
        assert_eq!(log.opened(), 0);
    }

    // Two visually distinct subjects; Cleo's pattern must never come back as Bob.
    #[test]
    fn test_scenario_two_subjects() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());
        enroll(&store, Subject::new(2, "Cleo", "arson"), &cleo_face());

        let camera = ScriptedCamera::new(vec![frame_with(&cleo_face(), &[SPOT])]);
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());

        let RecognizeOutcome::Matched(id) =
            pipeline.recognize(&CancelToken::new(), &mut NoPreview).unwrap()
        else {
            panic!("expected a match");
        };
        assert_eq!(id.result.subject_id, 2);
        assert_eq!(id.result.representative.subject_id, 2);
        assert_eq!(id.subject.map(|s| s.name), Some("Cleo".to_string()));
    }

    #[test]
    fn test_below_threshold_keeps_ticking() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());

        let cancel = CancelToken::new();
        let camera = ScriptedCamera::new(vec![frame_with(&cleo_face(), &[SPOT])])
            .cancel_after(3, cancel.clone());
        let pipeline = Pipeline::new(
            camera,
            FixedLocator::at(&[SPOT]),
            store.clone(),
            PipelineConfig {
                match_threshold: 0.0,
                ..config()
            },
        );

        let outcome = pipeline.recognize(&cancel, &mut NoPreview).unwrap();
        assert_eq!(outcome, RecognizeOutcome::Aborted);
    }

    #[test]
    fn test_read_failure_releases_camera() {
        let store = Arc::new(MemoryStore::new());
        enroll(&store, Subject::new(1, "Bob", "theft"), &bob_face());

        let camera = ScriptedCamera::new(vec![blank_frame()]).failing_read_at(2);
        let log = camera.log.clone();
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());

        let err = pipeline.recognize(&CancelToken::new(), &mut NoPreview).unwrap_err();
        assert!(matches!(err, SessionError::Capture(_)));
        assert_eq!(log.released(), 1);
    }

    #[test]
    fn test_match_without_metadata_still_reports() {
        let store = Arc::new(MemoryStore::new());
        for seq in 1..=3 {
            store
                .put_sample(SampleKey::new(4, SampleSource::Upload, seq), &cleo_face())
                .unwrap();
        }
        let camera = ScriptedCamera::new(vec![frame_with(&cleo_face(), &[SPOT])]);
        let pipeline = Pipeline::new(camera, FixedLocator::at(&[SPOT]), store.clone(), config());

        let RecognizeOutcome::Matched(id) =
            pipeline.recognize(&CancelToken::new(), &mut NoPreview).unwrap()
        else {
            panic!("expected a match");
        };
        assert_eq!(id.result.subject_id, 4);
        assert_eq!(id.subject, None);
    }
}
