//! Classifier Trainer: builds a fresh LBPH model from everything in the store.

use crate::error::SessionError;
use crate::lbph::{LbphError, LbphModel, LbphParams, Prediction};
use crate::store::SampleStore;
use crate::types::SampleKey;
use image::GrayImage;
use std::collections::BTreeSet;

/// An LBPH model plus the key of every sample it was fitted on.
///
/// Lives for one recognition run and is never persisted.
pub struct TrainedModel {
    model: LbphModel,
    keys: Vec<SampleKey>,
}

impl TrainedModel {
    /// Distinct subject ids seen during training.
    pub fn subject_ids(&self) -> BTreeSet<u32> {
        self.model.labels().iter().copied().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.keys.len()
    }

    pub fn predict(&self, face: &GrayImage) -> Result<Option<Prediction>, LbphError> {
        self.model.predict(face)
    }

    /// Key of the training sample at `index`, as reported by [`Prediction::index`].
    pub fn representative(&self, index: usize) -> Option<&SampleKey> {
        self.keys.get(index)
    }
}

/// Fit a model over the store's current samples, in listing order.
///
/// Fails with [`SessionError::EmptyCorpus`] before touching the classifier
/// when the store holds no samples.
pub fn train<S: SampleStore + ?Sized>(
    store: &S,
    params: LbphParams,
) -> Result<TrainedModel, SessionError> {
    let samples = store.list_samples()?;
    if samples.is_empty() {
        tracing::warn!("train: sample store is empty");
        return Err(SessionError::EmptyCorpus);
    }

    let model = LbphModel::train(
        params,
        samples.iter().map(|s| (&s.pixels, s.key.subject_id)),
    )?;
    let keys: Vec<SampleKey> = samples.into_iter().map(|s| s.key).collect();

    let trained = TrainedModel { model, keys };
    tracing::info!(
        samples = trained.sample_count(),
        subjects = trained.subject_ids().len(),
        "train: model fitted"
    );
    Ok(trained)
}
