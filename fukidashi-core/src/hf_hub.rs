use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use hf_hub::{
    Cache, Repo,
    api::tokio::{Api, ApiBuilder, Progress},
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::{Lazy, OnceCell};
use tracing::info;

static CACHE_DIR: OnceCell<PathBuf> = OnceCell::new();

static HF_API: Lazy<anyhow::Result<Api>> = Lazy::new(|| {
    Ok(ApiBuilder::new()
        .with_cache_dir(cache_dir().to_path_buf())
        .high()
        .build()?)
});
static HF_CACHE: Lazy<Cache> = Lazy::new(|| Cache::new(cache_dir().to_path_buf()));
static DOWNLOAD_BARS: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

/// Directory the model files are stored in.
///
/// Falls back to `<user cache dir>/Fukidashi/models` unless [`set_cache_dir`]
/// ran first.
pub fn cache_dir() -> &'static Path {
    CACHE_DIR.get_or_init(|| {
        dirs::cache_dir()
            .unwrap_or_default()
            .join("Fukidashi")
            .join("models")
    })
}

pub fn set_cache_dir(path: PathBuf) -> anyhow::Result<()> {
    CACHE_DIR
        .set(path)
        .map_err(|_| anyhow::anyhow!("cache dir has already been set"))
}

/// Path of `filename` in the local snapshot of `repo`, if it was downloaded before.
pub fn cached(repo: &str, filename: &str) -> Option<PathBuf> {
    HF_CACHE.repo(Repo::model(repo.to_string())).get(filename)
}

/// Fetch `filename` from the model `repo` on the Hub, hitting the cache first.
pub async fn hf_download(repo: &str, filename: &str) -> anyhow::Result<PathBuf> {
    if let Some(path) = cached(repo, filename) {
        return Ok(path);
    }

    let api = HF_API
        .as_ref()
        .map_err(|err| anyhow::anyhow!("failed to build Hugging Face Hub client: {err}"))?;

    info!(repo, filename, "downloading model file");

    let path = api
        .repo(Repo::model(repo.to_string()))
        .download_with_progress(filename, Reporter::new(filename))
        .await?;

    Ok(path)
}

/// One bar per file; concurrent downloads stack on [`DOWNLOAD_BARS`].
#[derive(Clone)]
struct Reporter {
    pb: ProgressBar,
}

impl Reporter {
    fn new(filename: &str) -> Self {
        let pb = DOWNLOAD_BARS.add(ProgressBar::new_spinner());
        pb.enable_steady_tick(Duration::from_millis(120));
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(style);
        }
        pb.set_message(filename.to_string());
        Self { pb }
    }
}

impl Progress for Reporter {
    async fn init(&mut self, size: usize, _filename: &str) {
        self.pb.set_length(size as u64);
        self.pb.set_position(0);
    }

    async fn update(&mut self, size: usize) {
        self.pb.inc(size as u64);
    }

    async fn finish(&mut self) {
        self.pb.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use hf_hub::api::tokio::Progress;

    use super::{Reporter, cache_dir, cached, set_cache_dir};

    #[test]
    fn cache_dir_is_set_once_and_snapshots_resolve() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        set_cache_dir(dir.path().to_path_buf())?;
        assert!(set_cache_dir(dir.path().join("other")).is_err());
        assert_eq!(cache_dir(), dir.path());

        assert!(cached("mayocream/manga-ocr", "vocab.txt").is_none());

        let repo_dir = dir.path().join("models--mayocream--manga-ocr");
        let snapshot = repo_dir.join("snapshots").join("abc123");
        fs::create_dir_all(repo_dir.join("refs"))?;
        fs::create_dir_all(&snapshot)?;
        fs::write(repo_dir.join("refs").join("main"), "abc123")?;
        fs::write(snapshot.join("vocab.txt"), "[PAD]\n")?;

        assert_eq!(
            cached("mayocream/manga-ocr", "vocab.txt"),
            Some(snapshot.join("vocab.txt"))
        );
        assert!(cached("mayocream/manga-ocr", "config.json").is_none());

        Ok(())
    }

    #[tokio::test]
    async fn reporter_tracks_bytes_of_one_file() {
        let mut reporter = Reporter::new("model.safetensors");
        assert_eq!(reporter.pb.message(), "model.safetensors");

        reporter.init(100, "model.safetensors").await;
        assert_eq!(reporter.pb.length(), Some(100));
        assert_eq!(reporter.pb.position(), 0);

        reporter.update(40).await;
        reporter.update(60).await;
        assert_eq!(reporter.pb.position(), 100);

        reporter.finish().await;
        assert!(reporter.pb.is_finished());
    }
}
