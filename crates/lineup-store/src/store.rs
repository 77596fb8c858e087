//! [`SqliteStore`], the durable [`SampleStore`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use image::GrayImage;
use lineup_core::store::check_subject_id;
use lineup_core::{Sample, SampleKey, SampleSource, SampleStore, StoreError, Subject};
use rusqlite::{params, Connection, OptionalExtension as _};

use crate::{schema::SCHEMA, Error, Result};

/// Subjects and samples in a single SQLite file.
///
/// Writers are serialised through one connection; listing order is insertion
/// order (`rowid`), and replacing a sample key gives it a fresh `rowid`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "sample store opened");
        Self::init(conn)
    }

    /// Open an in-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    fn count_samples(&self) -> Result<BTreeMap<u32, usize>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT subject_id, COUNT(*) FROM samples GROUP BY subject_id")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, u32>(0)?, r.get::<_, i64>(1)?)))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (id, n) = row?;
            counts.insert(id, n as usize);
        }
        Ok(counts)
    }

    fn insert_sample(&self, key: &SampleKey, pixels: &GrayImage) -> Result<()> {
        let conn = self.conn()?;
        // REPLACE deletes the old row, so the key moves to the end of the listing.
        conn.execute(
            "INSERT OR REPLACE INTO samples
               (subject_id, source, sequence, width, height, pixels, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.subject_id,
                key.source.as_str(),
                key.sequence,
                pixels.width(),
                pixels.height(),
                pixels.as_raw().as_slice(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn upsert_subject(&self, subject: &Subject) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO subjects (id, name, label, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               label = excluded.label,
               updated_at = excluded.updated_at",
            params![subject.id, subject.name, subject.label, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn query_samples(&self, filter: Option<&SampleKey>) -> Result<Vec<Sample>> {
        let conn = self.conn()?;
        let raw: Vec<RawSample> = match filter {
            None => {
                let mut stmt = conn.prepare(
                    "SELECT subject_id, source, sequence, width, height, pixels
                     FROM samples ORDER BY rowid",
                )?;
                let rows = stmt.query_map([], RawSample::from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            Some(key) => conn
                .query_row(
                    "SELECT subject_id, source, sequence, width, height, pixels
                     FROM samples WHERE subject_id = ?1 AND source = ?2 AND sequence = ?3",
                    params![key.subject_id, key.source.as_str(), key.sequence],
                    RawSample::from_row,
                )
                .optional()?
                .into_iter()
                .collect(),
        };
        drop(conn);
        raw.into_iter().map(RawSample::decode).collect()
    }

    fn query_subjects(&self) -> Result<BTreeMap<u32, Subject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, label FROM subjects")?;
        let rows = stmt.query_map([], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                label: r.get(2)?,
            })
        })?;
        let mut subjects = BTreeMap::new();
        for row in rows {
            let s = row?;
            subjects.insert(s.id, s);
        }
        Ok(subjects)
    }

    fn delete_subject(&self, id: u32) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM samples WHERE subject_id = ?1", params![id])?;
        tx.execute("DELETE FROM subjects WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed)
    }
}

/// A sample row before its columns are validated.
struct RawSample {
    subject_id: u32,
    source: String,
    sequence: u32,
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl RawSample {
    fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            subject_id: r.get(0)?,
            source: r.get(1)?,
            sequence: r.get(2)?,
            width: r.get(3)?,
            height: r.get(4)?,
            pixels: r.get(5)?,
        })
    }

    fn decode(self) -> Result<Sample> {
        let label = format!("{}-{}-{}", self.subject_id, self.source, self.sequence);
        let source: SampleSource = self.source.parse().map_err(|_| Error::Corrupt {
            key: label.clone(),
            reason: "unknown source".into(),
        })?;
        let len = self.pixels.len();
        let pixels = GrayImage::from_raw(self.width, self.height, self.pixels).ok_or_else(|| {
            Error::Corrupt {
                key: label,
                reason: format!("{len} bytes for a {}x{} image", self.width, self.height),
            }
        })?;
        Ok(Sample {
            key: SampleKey::new(self.subject_id, source, self.sequence),
            pixels,
        })
    }
}

impl SampleStore for SqliteStore {
    fn put_sample(
        &self,
        key: SampleKey,
        pixels: &GrayImage,
    ) -> Result<SampleKey, StoreError> {
        check_subject_id(key.subject_id)?;
        self.insert_sample(&key, pixels)?;
        tracing::trace!(%key, "sample stored");
        Ok(key)
    }

    fn put_metadata(&self, subject: &Subject) -> Result<(), StoreError> {
        check_subject_id(subject.id)?;
        self.upsert_subject(subject)?;
        Ok(())
    }

    fn list_samples(&self) -> Result<Vec<Sample>, StoreError> {
        Ok(self.query_samples(None)?)
    }

    fn get_all_metadata(&self) -> Result<BTreeMap<u32, Subject>, StoreError> {
        Ok(self.query_subjects()?)
    }

    fn get_sample(&self, key: &SampleKey) -> Result<Option<Sample>, StoreError> {
        Ok(self.query_samples(Some(key))?.pop())
    }

    /// Counted in SQL, without decoding any pixels.
    fn sample_counts(&self) -> Result<BTreeMap<u32, usize>, StoreError> {
        Ok(self.count_samples()?)
    }

    fn remove_subject(&self, id: u32) -> Result<usize, StoreError> {
        let removed = self.delete_subject(id)?;
        tracing::info!(subject = id, samples = removed, "subject removed");
        Ok(removed)
    }
}
