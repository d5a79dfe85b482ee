//! Opening and decoding input images, one outcome per path.

use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageReader};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{} is not a file", path.display())]
    NotAFile { path: PathBuf },

    #[error("error while reading file {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
}

impl LoadError {
    pub fn path(&self) -> &Path {
        match self {
            LoadError::NotAFile { path } | LoadError::Decode { path, .. } => path,
        }
    }
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub path: PathBuf,
    pub result: Result<DynamicImage, LoadError>,
}

/// Opens `path` and decodes every pixel up front, so corrupt or truncated
/// files fail here rather than later in the model.
///
/// The format is sniffed from the file content; the extension is only a hint.
pub fn load_image(path: &Path) -> Result<DynamicImage, LoadError> {
    if !path.is_file() {
        return Err(LoadError::NotAFile {
            path: path.to_path_buf(),
        });
    }

    decode(path).map_err(|source| LoadError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn decode(path: &Path) -> Result<DynamicImage, ImageError> {
    ImageReader::open(path)?.with_guessed_format()?.decode()
}

/// [`load_image`] over every path, in order. Never fails as a whole.
pub fn load_images<P: AsRef<Path>>(paths: &[P]) -> Vec<LoadOutcome> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            LoadOutcome {
                path: path.to_path_buf(),
                result: load_image(path),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};

    use super::{LoadError, load_image, load_images};

    fn write_png(dir: &std::path::Path, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
            .save_with_format(&path, ImageFormat::Png)
            .expect("write fixture");
        path
    }

    #[test]
    fn missing_file_is_not_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.png");

        let err = load_image(&path).expect_err("missing file must fail");
        assert!(matches!(err, LoadError::NotAFile { .. }));
        assert_eq!(err.path(), path);
        assert!(err.to_string().contains("missing.png"));
    }

    #[test]
    fn directory_is_not_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_image(dir.path()).expect_err("directory must fail");
        assert!(matches!(err, LoadError::NotAFile { .. }));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("corrupt.png");
        fs::write(&path, b"definitely not an image").expect("write");

        let err = load_image(&path).expect_err("garbage must fail");
        assert!(matches!(err, LoadError::Decode { .. }));
        assert!(err.to_string().contains("corrupt.png"));
    }

    #[test]
    fn truncated_png_fails_to_decode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_png(dir.path(), "full.png", 64, 64);
        let bytes = fs::read(&path).expect("read");
        let truncated = dir.path().join("truncated.png");
        fs::write(&truncated, &bytes[..bytes.len() / 2]).expect("write");

        assert!(matches!(
            load_image(&truncated),
            Err(LoadError::Decode { .. })
        ));
    }

    #[test]
    fn format_is_sniffed_from_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let png = write_png(dir.path(), "panel.png", 5, 7);
        let misnamed = dir.path().join("panel.jpg");
        fs::rename(&png, &misnamed).expect("rename");

        let image = load_image(&misnamed).expect("png with jpg extension still loads");
        assert_eq!(image.dimensions(), (5, 7));
    }

    #[test]
    fn outcomes_follow_input_order_and_keep_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = write_png(dir.path(), "a.png", 3, 1);
        let b = write_png(dir.path(), "b.png", 4, 1);
        let missing = dir.path().join("missing.png");

        let outcomes = load_images(&[&a, &missing, &b, &a]);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[1].path, missing);
        assert!(outcomes[1].result.is_err());

        let widths: Vec<u32> = outcomes
            .into_iter()
            .filter_map(|outcome| outcome.result.ok())
            .map(|image| image.width())
            .collect();
        assert_eq!(widths, vec![3, 4, 3]);
    }

    #[test]
    fn empty_input_gives_no_outcomes() {
        let paths: [&str; 0] = [];
        assert!(load_images(&paths).is_empty());
    }
}
