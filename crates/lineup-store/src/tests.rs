//! Tests for `SqliteStore` against in-memory and on-disk databases.

use image::GrayImage;
use lineup_core::{SampleKey, SampleSource, SampleStore, StoreError, Subject};

use crate::SqliteStore;

fn store() -> SqliteStore {
    SqliteStore::open_in_memory().expect("in-memory store")
}

fn crop(seed: u8) -> GrayImage {
    GrayImage::from_fn(6, 5, |x, y| image::Luma([seed.wrapping_add((x * 7 + y) as u8)]))
}

fn key(id: u32, source: SampleSource, seq: u32) -> SampleKey {
    SampleKey::new(id, source, seq)
}

// ─── Subjects ────────────────────────────────────────────────────────────────

#[test]
fn metadata_upsert_is_last_write_wins() {
    let s = store();
    s.put_metadata(&Subject::new(7, "Alice", "fraud")).unwrap();
    s.put_metadata(&Subject::new(3, "Bob", "theft")).unwrap();
    s.put_metadata(&Subject::new(7, "Alice", "forgery")).unwrap();

    let all = s.get_all_metadata().unwrap();
    assert_eq!(all.keys().copied().collect::<Vec<_>>(), [3, 7]);
    assert_eq!(all[&7].label, "forgery");
    assert_eq!(s.get_subject(3).unwrap(), Some(Subject::new(3, "Bob", "theft")));
    assert_eq!(s.get_subject(4).unwrap(), None);
}

#[test]
fn subject_zero_is_rejected() {
    let s = store();
    assert!(matches!(
        s.put_metadata(&Subject::new(0, "Nobody", "none")),
        Err(StoreError::InvalidSubject(0))
    ));
    assert!(matches!(
        s.put_sample(key(0, SampleSource::Camera, 1), &crop(1)),
        Err(StoreError::InvalidSubject(0))
    ));
}

// ─── Samples ─────────────────────────────────────────────────────────────────

#[test]
fn samples_round_trip_pixels() {
    let s = store();
    let k = key(7, SampleSource::Upload, 2);
    assert_eq!(s.put_sample(k.clone(), &crop(40)).unwrap(), k);

    let got = s.get_sample(&k).unwrap().expect("stored sample");
    assert_eq!(got.key, k);
    assert_eq!(got.pixels, crop(40));
    assert!(s.get_sample(&key(7, SampleSource::Camera, 2)).unwrap().is_none());
}

#[test]
fn samples_list_in_insertion_order() {
    let s = store();
    s.put_sample(key(2, SampleSource::Camera, 1), &crop(1)).unwrap();
    s.put_sample(key(1, SampleSource::Upload, 1), &crop(2)).unwrap();
    s.put_sample(key(2, SampleSource::Camera, 2), &crop(3)).unwrap();

    let keys: Vec<String> = s
        .list_samples()
        .unwrap()
        .iter()
        .map(|x| x.key.to_string())
        .collect();
    assert_eq!(keys, ["2-camera-1", "1-upload-1", "2-camera-2"]);
}

#[test]
fn replacing_a_key_overwrites_and_moves_it_last() {
    let s = store();
    let first = key(2, SampleSource::Camera, 1);
    s.put_sample(first.clone(), &crop(1)).unwrap();
    s.put_sample(key(2, SampleSource::Camera, 2), &crop(2)).unwrap();
    s.put_sample(first.clone(), &crop(9)).unwrap();

    let samples = s.list_samples().unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[1].key, first);
    assert_eq!(samples[1].pixels, crop(9));
}

#[test]
fn samples_without_metadata_are_listed() {
    let s = store();
    s.put_sample(key(5, SampleSource::Upload, 1), &crop(1)).unwrap();
    assert_eq!(s.list_samples().unwrap().len(), 1);
    assert!(s.get_all_metadata().unwrap().is_empty());
}

#[test]
fn sample_counts_group_by_subject() {
    let s = store();
    for seq in 1..=3 {
        s.put_sample(key(1, SampleSource::Camera, seq), &crop(1)).unwrap();
    }
    s.put_sample(key(4, SampleSource::Upload, 1), &crop(1)).unwrap();
    s.put_sample(key(1, SampleSource::Camera, 2), &crop(9)).unwrap();
    let dyn_store: &dyn SampleStore = &s;
    let counts = dyn_store.sample_counts().unwrap();
    assert_eq!(counts.get(&1), Some(&3));
    assert_eq!(counts.get(&4), Some(&1));
    assert_eq!(counts.len(), 2);

    // The SQL count agrees with counting the decoded listing.
    let mut listed = std::collections::BTreeMap::<u32, usize>::new();
    for sample in s.list_samples().unwrap() {
        *listed.entry(sample.key.subject_id).or_default() += 1;
    }
    assert_eq!(counts, listed);
}

#[test]
fn remove_subject_drops_metadata_and_samples() {
    let s = store();
    s.put_metadata(&Subject::new(1, "Bob", "theft")).unwrap();
    s.put_metadata(&Subject::new(2, "Cleo", "arson")).unwrap();
    s.put_sample(key(1, SampleSource::Camera, 1), &crop(1)).unwrap();
    s.put_sample(key(1, SampleSource::Upload, 1), &crop(1)).unwrap();
    s.put_sample(key(2, SampleSource::Camera, 1), &crop(1)).unwrap();

    assert_eq!(s.remove_subject(1).unwrap(), 2);
    assert_eq!(s.remove_subject(1).unwrap(), 0);
    assert!(s.get_subject(1).unwrap().is_none());
    let left = s.list_samples().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].key.subject_id, 2);
}

#[test]
fn corrupt_pixel_blob_is_reported() {
    let s = store();
    s.conn()
        .unwrap()
        .execute(
            "INSERT INTO samples (subject_id, source, sequence, width, height, pixels, captured_at)
             VALUES (3, 'camera', 1, 10, 10, x'0102', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    assert!(matches!(s.list_samples(), Err(StoreError::Corrupt(_))));
}

// ─── Persistence ─────────────────────────────────────────────────────────────

#[test]
fn reopening_a_file_keeps_everything() {
    let dir = std::env::temp_dir().join(format!("lineup-store-test-{}", std::process::id()));
    let path = dir.join("nested").join("lineup.db");
    let _ = std::fs::remove_dir_all(&dir);

    {
        let s = SqliteStore::open(&path).unwrap();
        s.put_metadata(&Subject::new(7, "Alice", "fraud")).unwrap();
        s.put_sample(key(7, SampleSource::Camera, 1), &crop(3)).unwrap();
    }

    let s = SqliteStore::open(&path).unwrap();
    assert_eq!(s.get_subject(7).unwrap().map(|x| x.name), Some("Alice".into()));
    let samples = s.list_samples().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].pixels, crop(3));

    drop(s);
    let _ = std::fs::remove_dir_all(&dir);
}
