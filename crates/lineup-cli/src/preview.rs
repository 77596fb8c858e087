use image::GrayImage;
use lineup_core::capture::annotate;
use lineup_core::{BoundingBox, PreviewSink};
use std::path::PathBuf;

/// Overwrites one PNG with the latest annotated frame.
///
/// Write failures are logged once and further frames are dropped.
pub struct FilePreview {
    path: PathBuf,
    written: usize,
    failed: bool,
}

impl FilePreview {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: 0,
            failed: false,
        }
    }
}

impl Drop for FilePreview {
    fn drop(&mut self) {
        if self.written > 0 {
            tracing::debug!(path = %self.path.display(), frames = self.written, "preview closed");
        }
    }
}

impl PreviewSink for FilePreview {
    fn show(&mut self, frame: &GrayImage, faces: &[BoundingBox]) {
        if self.failed {
            return;
        }
        match annotate(frame, faces).save(&self.path) {
            Ok(()) => self.written += 1,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "preview disabled");
                self.failed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_annotated_png() {
        let dir = std::env::temp_dir().join(format!("lineup-preview-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("preview.png");

        let mut preview = FilePreview::new(&path);
        let frame = GrayImage::new(20, 20);
        preview.show(&frame, &[BoundingBox::new(2, 2, 10, 10)]);
        preview.show(&frame, &[]);
        assert_eq!(preview.written, 2);

        let saved = image::open(&path).unwrap().to_luma8();
        assert_eq!(saved.dimensions(), (20, 20));
        assert_eq!(saved.get_pixel(2, 2).0[0], 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unwritable_path_disables() {
        let mut preview = FilePreview::new("/nonexistent-dir/lineup/preview.png");
        let frame = GrayImage::new(4, 4);
        preview.show(&frame, &[]);
        preview.show(&frame, &[]);
        assert_eq!(preview.written, 0);
        assert!(preview.failed);
    }
}
