mod bert;
mod model;
mod postprocess;
mod tokenizer;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use image::{DynamicImage, GenericImageView, imageops::FilterType};
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument};

use fukidashi_core::hf_hub::hf_download;
use model::{PreprocessorConfig, VisionEncoderDecoder, VisionEncoderDecoderConfig};

use crate::{OcrConfig, device};

pub use postprocess::post_process;

/// Files a manga-ocr repository on the Hub has to provide.
#[derive(Debug, Clone, Copy, strum::EnumIter, strum::IntoStaticStr)]
pub enum Manifest {
    #[strum(serialize = "config.json")]
    Config,
    #[strum(serialize = "preprocessor_config.json")]
    PreprocessorConfig,
    #[strum(serialize = "vocab.txt")]
    Vocab,
    #[strum(serialize = "special_tokens_map.json")]
    SpecialTokensMap,
    #[strum(serialize = "model.safetensors")]
    Model,
}

impl Manifest {
    pub fn filename(self) -> &'static str {
        self.into()
    }

    pub async fn get(self, repo: &str) -> Result<PathBuf> {
        hf_download(repo, self.filename())
            .await
            .with_context(|| format!("failed to fetch {} from {repo}", self.filename()))
    }
}

pub struct MangaOcr {
    model: VisionEncoderDecoder,
    tokenizer: Tokenizer,
    preprocessor: PreprocessorConfig,
    device: Device,
}

impl MangaOcr {
    #[instrument(level = "info", skip_all, fields(model = %config.model))]
    pub async fn load(config: &OcrConfig) -> Result<Self> {
        info!("loading OCR model");
        let device = device(config.device)?;

        let config_path = Manifest::Config.get(&config.model).await?;
        let preprocessor_path = Manifest::PreprocessorConfig.get(&config.model).await?;
        let vocab_path = Manifest::Vocab.get(&config.model).await?;
        let special_tokens_path = Manifest::SpecialTokensMap.get(&config.model).await?;
        let weights_path = Manifest::Model.get(&config.model).await?;

        let model_config: VisionEncoderDecoderConfig =
            load_json(&config_path).context("failed to parse model config")?;
        let preprocessor: PreprocessorConfig =
            load_json(&preprocessor_path).context("failed to parse preprocessor config")?;
        let tokenizer = tokenizer::load_tokenizer(&vocab_path, &special_tokens_path)?;
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)? };
        let model = VisionEncoderDecoder::new(model_config, config.max_length, vb, device.clone())?;

        let ocr = Self {
            model,
            tokenizer,
            preprocessor,
            device,
        };

        if config.warmup {
            ocr.warmup()?;
        }

        info!("OCR ready");
        Ok(ocr)
    }

    /// One text per image, in input order. An empty batch never reaches the model.
    #[instrument(level = "info", skip_all, fields(batch = images.len()))]
    pub fn inference(&self, images: &[DynamicImage]) -> Result<Vec<String>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let pixel_values = self.preprocess(images)?;
        let sequences = self.model.generate(&pixel_values)?;
        sequences
            .iter()
            .map(|token_ids| {
                let text = tokenizer::decode(&self.tokenizer, token_ids)?;
                Ok(post_process(&text))
            })
            .collect()
    }

    /// Runs the model once on a blank page.
    fn warmup(&self) -> Result<()> {
        let size = self.preprocessor.size.max(1);
        let blank = DynamicImage::new_rgb8(size, size);
        let output = self.inference(std::slice::from_ref(&blank))?;
        debug!(?output, "warm-up finished");
        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    fn preprocess(&self, images: &[DynamicImage]) -> Result<Tensor> {
        let tensors = images
            .iter()
            .map(|image| preprocess_image(image, &self.preprocessor, &self.device))
            .collect::<Result<Vec<_>>>()?;
        if !self.preprocessor.do_resize {
            let first = tensors[0].dims();
            anyhow::ensure!(
                tensors.iter().all(|t| t.dims() == first),
                "images of different sizes cannot share a batch without resizing"
            );
        }
        Ok(Tensor::cat(&tensors, 0)?)
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}

/// Grayscale, resize, back to three channels, scale to `[0, 1]` and normalize.
/// Returns a `(1, 3, h, w)` tensor.
fn preprocess_image(
    image: &DynamicImage,
    preprocessor: &PreprocessorConfig,
    device: &Device,
) -> Result<Tensor> {
    let gray = DynamicImage::ImageLuma8(image.to_luma8());
    let gray = if preprocessor.do_resize {
        gray.resize_exact(preprocessor.size, preprocessor.size, FilterType::Triangle)
    } else {
        gray
    };
    let (width, height) = gray.dimensions();

    let tensor = Tensor::from_vec(
        gray.to_rgb8().into_raw(),
        (1, height as usize, width as usize, 3),
        device,
    )?
    .permute((0, 3, 1, 2))?
    .to_dtype(DType::F32)?;
    let tensor = (tensor * (1.0 / 255.0))?;

    if !preprocessor.do_normalize {
        return Ok(tensor);
    }

    let std = preprocessor
        .image_std
        .map(|value| if value == 0.0 { 1.0 } else { value });
    let mean = Tensor::from_slice(&preprocessor.image_mean, (1, 3, 1, 1), device)?;
    let std = Tensor::from_slice(&std, (1, 3, 1, 1), device)?;
    Ok(tensor.broadcast_sub(&mean)?.broadcast_div(&std)?)
}
