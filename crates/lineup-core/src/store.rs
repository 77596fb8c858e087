//! Sample Store: subject metadata plus the face crops enrolled for them.

use crate::types::{Sample, SampleKey, Subject};
use image::GrayImage;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("invalid subject id {0} (must be positive)")]
    InvalidSubject(u32),
}

/// Durable mapping from subject ids to metadata and face samples.
///
/// Writes are last-write-wins: a second `put_metadata` for the same id
/// replaces the first, and a second `put_sample` for the same key replaces
/// the earlier crop. Implementations serialise writers internally.
pub trait SampleStore: Send + Sync {
    /// Store one crop under `key`, returning the key it was stored under.
    fn put_sample(&self, key: SampleKey, pixels: &GrayImage) -> Result<SampleKey, StoreError>;

    /// Insert or overwrite the subject's descriptive record.
    fn put_metadata(&self, subject: &Subject) -> Result<(), StoreError>;

    /// All stored samples, in insertion order.
    fn list_samples(&self) -> Result<Vec<Sample>, StoreError>;

    /// The full metadata table keyed by subject id.
    fn get_all_metadata(&self) -> Result<BTreeMap<u32, Subject>, StoreError>;

    fn get_sample(&self, key: &SampleKey) -> Result<Option<Sample>, StoreError>;

    fn get_subject(&self, id: u32) -> Result<Option<Subject>, StoreError> {
        Ok(self.get_all_metadata()?.remove(&id))
    }

    /// Number of stored samples per subject id, including ids with no metadata.
    fn sample_counts(&self) -> Result<BTreeMap<u32, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for sample in self.list_samples()? {
            *counts.entry(sample.key.subject_id).or_default() += 1;
        }
        Ok(counts)
    }

    /// Delete a subject's metadata and samples. Returns the number of samples removed.
    fn remove_subject(&self, id: u32) -> Result<usize, StoreError>;
}

/// Reject the reserved id 0.
pub fn check_subject_id(id: u32) -> Result<(), StoreError> {
    if id == 0 {
        Err(StoreError::InvalidSubject(id))
    } else {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    subjects: BTreeMap<u32, Subject>,
    samples: Vec<Sample>,
}

/// In-process store, lost on exit.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl SampleStore for MemoryStore {
    fn put_sample(&self, key: SampleKey, pixels: &GrayImage) -> Result<SampleKey, StoreError> {
        check_subject_id(key.subject_id)?;
        let mut inner = self.lock()?;
        // An overwritten key moves to the end, as a fresh insert would.
        inner.samples.retain(|s| s.key != key);
        inner.samples.push(Sample {
            key: key.clone(),
            pixels: pixels.clone(),
        });
        Ok(key)
    }

    fn put_metadata(&self, subject: &Subject) -> Result<(), StoreError> {
        check_subject_id(subject.id)?;
        self.lock()?.subjects.insert(subject.id, subject.clone());
        Ok(())
    }

    fn list_samples(&self) -> Result<Vec<Sample>, StoreError> {
        Ok(self.lock()?.samples.clone())
    }

    fn get_all_metadata(&self) -> Result<BTreeMap<u32, Subject>, StoreError> {
        Ok(self.lock()?.subjects.clone())
    }

    fn get_sample(&self, key: &SampleKey) -> Result<Option<Sample>, StoreError> {
        Ok(self.lock()?.samples.iter().find(|s| &s.key == key).cloned())
    }

    fn get_subject(&self, id: u32) -> Result<Option<Subject>, StoreError> {
        Ok(self.lock()?.subjects.get(&id).cloned())
    }

    fn remove_subject(&self, id: u32) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        inner.subjects.remove(&id);
        let before = inner.samples.len();
        inner.samples.retain(|s| s.key.subject_id != id);
        Ok(before - inner.samples.len())
    }
}
