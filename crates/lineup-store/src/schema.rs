//! SQL schema for the sample store.

/// Idempotent DDL run on every open.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS subjects (
    id          INTEGER PRIMARY KEY CHECK (id > 0),
    name        TEXT NOT NULL,
    label       TEXT NOT NULL,
    updated_at  TEXT NOT NULL    -- RFC 3339 UTC
);

-- Samples may exist without a subjects row; metadata is optional at match time.
CREATE TABLE IF NOT EXISTS samples (
    subject_id  INTEGER NOT NULL CHECK (subject_id > 0),
    source      TEXT NOT NULL,   -- 'camera' | 'upload'
    sequence    INTEGER NOT NULL,
    width       INTEGER NOT NULL,
    height      INTEGER NOT NULL,
    pixels      BLOB NOT NULL,   -- row-major, one byte per pixel
    captured_at TEXT NOT NULL,
    UNIQUE (subject_id, source, sequence)
);

CREATE INDEX IF NOT EXISTS samples_by_subject ON samples(subject_id);
";
