use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use fukidashi_ml::{DEFAULT_MODEL, DevicePreference, OcrConfig, manga_ocr::MangaOcr};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::ocr::Ocr;

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[arg(value_name = "FILE", required = true, help = "Images to read text from")]
    pub inputs: Vec<PathBuf>,

    #[arg(
        long,
        help = "Force using CPU even if GPU is available",
        default_value_t = false
    )]
    pub cpu: bool,

    #[arg(
        long,
        value_name = "REPO",
        help = "Hugging Face Hub repository of the recognition model",
        default_value = DEFAULT_MODEL
    )]
    pub model: String,

    #[arg(long, value_name = "DIR", help = "Directory to keep downloaded models in")]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Skip the warm-up pass after loading the model",
        default_value_t = false
    )]
    pub no_warmup: bool,
}

impl Cli {
    pub fn ocr_config(&self) -> OcrConfig {
        OcrConfig {
            model: self.model.clone(),
            device: if self.cpu {
                DevicePreference::Cpu
            } else {
                DevicePreference::Auto
            },
            warmup: !self.no_warmup,
            ..OcrConfig::default()
        }
    }
}

fn initialize(cli: &Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if let Some(dir) = &cli.cache_dir {
        fukidashi_ml::set_cache_dir(dir.clone())?;
    }

    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    initialize(&cli)?;

    let model = MangaOcr::load(&cli.ocr_config())
        .await
        .context("failed to load the OCR model")?;
    let ocr = Ocr::new(model);

    for text in ocr.recognize_paths(&cli.inputs)? {
        println!("{text}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use fukidashi_ml::DevicePreference;

    use super::Cli;

    #[test]
    fn defaults_map_to_auto_device_and_default_model() {
        let cli = Cli::parse_from(["fukidashi", "a.png", "b.jpg"]);
        assert_eq!(cli.inputs.len(), 2);

        let config = cli.ocr_config();
        assert_eq!(config.model, "mayocream/manga-ocr");
        assert_eq!(config.device, DevicePreference::Auto);
        assert!(config.warmup);
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "fukidashi",
            "--cpu",
            "--no-warmup",
            "--model",
            "kha-white/manga-ocr-base",
            "page.png",
        ]);

        let config = cli.ocr_config();
        assert_eq!(config.model, "kha-white/manga-ocr-base");
        assert_eq!(config.device, DevicePreference::Cpu);
        assert!(!config.warmup);
        assert_eq!(config.max_length, 300);
    }

    #[test]
    fn at_least_one_input_is_required() {
        assert!(Cli::try_parse_from(["fukidashi"]).is_err());
    }
}
