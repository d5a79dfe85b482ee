use std::path::Path;

use anyhow::Result;
use fukidashi_ml::manga_ocr::MangaOcr;
use image::DynamicImage;
use tracing::{instrument, warn};

use crate::loader::{LoadError, load_images};

/// A model turning a batch of images into one text per image, in order.
pub trait TextRecognizer {
    fn recognize(&self, images: &[DynamicImage]) -> Result<Vec<String>>;
}

impl TextRecognizer for MangaOcr {
    fn recognize(&self, images: &[DynamicImage]) -> Result<Vec<String>> {
        self.inference(images)
    }
}

impl<R: TextRecognizer + ?Sized> TextRecognizer for &R {
    fn recognize(&self, images: &[DynamicImage]) -> Result<Vec<String>> {
        (**self).recognize(images)
    }
}

/// Reads image files and hands the readable ones to the recognizer in a single call.
pub struct Ocr<R> {
    recognizer: R,
}

impl<R: TextRecognizer> Ocr<R> {
    pub fn new(recognizer: R) -> Self {
        Self { recognizer }
    }

    /// Decoded images for every readable path, in input order.
    /// Unreadable paths are logged and left out.
    pub fn load_images<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<DynamicImage> {
        load_images(paths)
            .into_iter()
            .filter_map(|outcome| outcome.result.inspect_err(report).ok())
            .collect()
    }

    /// Texts for the readable paths, in input order; the result can be shorter than `paths`.
    ///
    /// Recognizer failures are returned as is. When nothing could be read the
    /// recognizer is not called.
    #[instrument(level = "info", skip_all, fields(paths = paths.len()))]
    pub fn recognize_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Vec<String>> {
        let images = self.load_images(paths);
        if images.is_empty() {
            return Ok(Vec::new());
        }

        self.recognizer.recognize(&images)
    }
}

fn report(err: &LoadError) {
    match err {
        LoadError::NotAFile { path } => warn!(path = %path.display(), "{err}"),
        LoadError::Decode { path, source } => {
            warn!(path = %path.display(), error = %source, "{err}")
        }
    }
}
