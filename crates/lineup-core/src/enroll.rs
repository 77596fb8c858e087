//! Sample Acquirer: captures face crops for one subject until a quota is met,
//! and the upload path that ingests faces from still images.

use crate::capture::{CameraDevice, CancelToken, PreviewSink};
use crate::detector::FaceLocator;
use crate::error::SessionError;
use crate::pipeline::Pipeline;
use crate::store::SampleStore;
use crate::types::{SampleKey, SampleSource, Subject};
use image::GrayImage;
use std::borrow::Cow;

/// Crops captured per enrollment unless the caller asks otherwise.
pub const DEFAULT_QUOTA: usize = 30;
/// Camera sample numbers are `u32`, so no session can ask for more.
pub const MAX_QUOTA: usize = u32::MAX as usize;

#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub subject: Subject,
    pub quota: usize,
}

impl AcquireRequest {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            quota: DEFAULT_QUOTA,
        }
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = quota;
        self
    }

    fn validate(&self) -> Result<(), SessionError> {
        validate_subject(&self.subject)?;
        if self.quota == 0 {
            return Err(SessionError::InvalidRequest("quota must be at least 1".into()));
        }
        if self.quota > MAX_QUOTA {
            return Err(SessionError::InvalidRequest(format!(
                "quota {} exceeds the maximum of {MAX_QUOTA}",
                self.quota
            )));
        }
        Ok(())
    }
}

/// Terminal state of an acquisition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The quota was reached. A frame with several faces may overshoot it.
    Complete { samples: Vec<SampleKey> },
    /// The operator cancelled. Samples already written stay in the store.
    Cancelled { samples: Vec<SampleKey> },
}

impl AcquireOutcome {
    pub fn samples(&self) -> &[SampleKey] {
        match self {
            AcquireOutcome::Complete { samples } | AcquireOutcome::Cancelled { samples } => samples,
        }
    }
}

/// Result of ingesting uploaded images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub stored: Vec<SampleKey>,
    /// Names of uploads in which no face was found.
    pub skipped: Vec<String>,
}

fn validate_subject(subject: &Subject) -> Result<(), SessionError> {
    if subject.id == 0 {
        return Err(SessionError::InvalidRequest("subject id must be positive".into()));
    }
    if subject.name.trim().is_empty() {
        return Err(SessionError::InvalidRequest("subject name is empty".into()));
    }
    Ok(())
}

impl<C, L, S> Pipeline<C, L, S>
where
    C: CameraDevice,
    L: FaceLocator,
    S: SampleStore + ?Sized,
{
    /// Run one acquisition session for `request.subject`.
    ///
    /// Metadata is written once, after the camera is acquired. Every face in a
    /// frame becomes a sample, so the count can exceed the quota by up to the
    /// number of faces in the last frame minus one. The camera is released on
    /// every exit path.
    pub fn acquire_samples(
        &self,
        request: &AcquireRequest,
        cancel: &CancelToken,
        preview: &mut dyn PreviewSink,
    ) -> Result<AcquireOutcome, SessionError> {
        request.validate()?;
        let subject = &request.subject;

        let mut stream = self.open_camera()?;
        self.store.put_metadata(subject)?;
        tracing::info!(
            subject = subject.id,
            name = %subject.name,
            quota = request.quota,
            "acquire: capturing"
        );

        let mut counter: u32 = 0;
        let mut samples = Vec::new();
        loop {
            if cancel.is_cancelled() {
                tracing::info!(subject = subject.id, captured = samples.len(), "acquire: cancelled");
                return Ok(AcquireOutcome::Cancelled { samples });
            }

            let frame = self.next_frame(stream.as_mut())?;
            let faces = self.locator.locate(&frame);
            for face in &faces {
                let Some(crop) = face.crop(&frame) else {
                    continue;
                };
                counter = counter.checked_add(1).ok_or_else(|| {
                    SessionError::InternalConsistency("camera sample numbers exhausted".into())
                })?;
                let key = SampleKey::new(subject.id, SampleSource::Camera, counter);
                samples.push(self.store.put_sample(key, &crop)?);
            }
            preview.show(&frame, &faces);
            tracing::debug!(faces = faces.len(), captured = counter, "acquire: tick");

            if samples.len() >= request.quota {
                tracing::info!(subject = subject.id, captured = samples.len(), "acquire: complete");
                return Ok(AcquireOutcome::Complete { samples });
            }
            self.pause();
        }
    }

    /// Enroll faces found in still images under `subject`.
    ///
    /// Each face found becomes an [`SampleSource::Upload`] sample numbered from 1.
    /// Images are mirrored like camera frames when the pipeline mirrors, so
    /// both kinds of sample share one orientation. Fails with [`SessionError::NoFaceDetected`], writing nothing, when no
    /// image contains a face.
    pub fn ingest_upload(
        &self,
        subject: &Subject,
        uploads: &[(String, GrayImage)],
    ) -> Result<IngestReport, SessionError> {
        validate_subject(subject)?;

        let mut crops = Vec::new();
        let mut report = IngestReport::default();
        for (name, image) in uploads {
            let image: Cow<'_, GrayImage> = if self.config.mirror {
                Cow::Owned(image::imageops::flip_horizontal(image))
            } else {
                Cow::Borrowed(image)
            };
            let faces = self.locator.locate(&image);
            let before = crops.len();
            crops.extend(faces.iter().filter_map(|f| f.crop(&image)));
            if crops.len() == before {
                tracing::warn!(upload = %name, "upload: no face found");
                report.skipped.push(name.clone());
            }
        }
        if crops.is_empty() {
            return Err(SessionError::NoFaceDetected);
        }

        self.store.put_metadata(subject)?;
        for (i, crop) in crops.iter().enumerate() {
            let key = SampleKey::new(subject.id, SampleSource::Upload, i as u32 + 1);
            report.stored.push(self.store.put_sample(key, crop)?);
        }
        tracing::info!(
            subject = subject.id,
            stored = report.stored.len(),
            skipped = report.skipped.len(),
            "upload: ingested"
        );
        Ok(report)
    }
}
