//! BERT decoder with cross-attention over the image encoder states, as used by
//! the manga-ocr vision-encoder-decoder. Inference only: dropout is omitted.

use anyhow::Result;
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder, embedding, layer_norm, linear};
use serde::Deserialize;

const MASKED: f64 = -10000.0;

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HiddenAct {
    Gelu,
    #[serde(other)]
    GeluApproximate,
}

impl HiddenAct {
    fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            HiddenAct::Gelu => xs.gelu_erf(),
            HiddenAct::GeluApproximate => xs.gelu(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    pub layer_norm_eps: f64,
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub is_decoder: bool,
}

pub struct BertForCausalLM {
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    head: LmHead,
    causal: bool,
    device: Device,
}

impl BertForCausalLM {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let pad_token_id = cfg.pad_token_id.unwrap_or(0);
        if pad_token_id as usize >= cfg.vocab_size {
            anyhow::bail!("pad_token_id {} is outside of vocab", pad_token_id);
        }

        let bert = vb.pp("bert");
        let layers_vb = bert.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| BertLayer::new(cfg, layers_vb.pp(idx)))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            embeddings: BertEmbeddings::new(cfg, bert.pp("embeddings"))?,
            layers,
            head: LmHead::new(cfg, vb.pp("cls").pp("predictions"))?,
            causal: cfg.is_decoder,
            device: vb.device().clone(),
        })
    }

    /// Returns logits of shape `(batch, seq_len, vocab_size)`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: &Tensor,
        encoder_attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut hidden_states = self.embeddings.forward(input_ids, token_type_ids)?;
        let dtype = hidden_states.dtype();

        let seq_len = input_ids.dim(1)?;
        let mut self_mask = expand_attention_mask(attention_mask, seq_len, &self.device, dtype)?;
        if self.causal {
            self_mask = self_mask.broadcast_add(&causal_mask(seq_len, &self.device, dtype)?)?;
        }
        let cross_mask = expand_attention_mask(
            encoder_attention_mask,
            encoder_hidden_states.dim(1)?,
            &self.device,
            dtype,
        )?;

        for layer in &self.layers {
            hidden_states = layer.forward(
                &hidden_states,
                &self_mask,
                encoder_hidden_states,
                &cross_mask,
            )?;
        }

        Ok(self.head.forward(&hidden_states)?)
    }
}

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                cfg.type_vocab_size,
                cfg.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor) -> candle_core::Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let position_ids =
            Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let embeddings = (self.word_embeddings.forward(input_ids)?
            + self.token_type_embeddings.forward(token_type_ids)?)?
        .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        self.layer_norm.forward(&embeddings)
    }
}

struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: ResidualOutput,
    num_heads: usize,
    head_size: usize,
}

impl Attention {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let head_size = cfg.hidden_size / cfg.num_attention_heads;
        let all_head_size = head_size * cfg.num_attention_heads;
        let self_vb = vb.pp("self");
        Ok(Self {
            query: linear(cfg.hidden_size, all_head_size, self_vb.pp("query"))?,
            key: linear(cfg.hidden_size, all_head_size, self_vb.pp("key"))?,
            value: linear(cfg.hidden_size, all_head_size, self_vb.pp("value"))?,
            output: ResidualOutput::new(cfg.hidden_size, cfg, vb.pp("output"))?,
            num_heads: cfg.num_attention_heads,
            head_size,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Self-attention when `key_value_states` is `None`, cross-attention otherwise.
    fn forward(
        &self,
        hidden_states: &Tensor,
        mask: &Tensor,
        key_value_states: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let kv_states = key_value_states.unwrap_or(hidden_states);
        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let query = self.split_heads(&self.query.forward(hidden_states)?)?;
        let key = self.split_heads(&self.key.forward(kv_states)?)?;
        let value = self.split_heads(&self.value.forward(kv_states)?)?;

        let scores = (query.matmul(&key.t()?)? / (self.head_size as f64).sqrt())?
            .broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let context = probs.matmul(&value)?.transpose(1, 2)?.contiguous()?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_size,
        ))?;

        self.output.forward(&context, hidden_states)
    }
}

/// `LayerNorm(dense(x) + residual)`, shared by the attention and feed-forward outputs.
struct ResidualOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl ResidualOutput {
    fn new(in_dim: usize, cfg: &BertConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            dense: linear(in_dim, cfg.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, residual: &Tensor) -> candle_core::Result<Tensor> {
        self.layer_norm
            .forward(&(self.dense.forward(xs)? + residual)?)
    }
}

struct BertLayer {
    attention: Attention,
    cross_attention: Attention,
    intermediate: Linear,
    activation: HiddenAct,
    output: ResidualOutput,
}

impl BertLayer {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attention: Attention::new(cfg, vb.pp("attention"))?,
            cross_attention: Attention::new(cfg, vb.pp("crossattention"))?,
            intermediate: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: cfg.hidden_act,
            output: ResidualOutput::new(cfg.intermediate_size, cfg, vb.pp("output"))?,
        })
    }

    fn forward(
        &self,
        hidden_states: &Tensor,
        self_mask: &Tensor,
        encoder_hidden_states: &Tensor,
        cross_mask: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let attended = self.attention.forward(hidden_states, self_mask, None)?;
        let attended =
            self.cross_attention
                .forward(&attended, cross_mask, Some(encoder_hidden_states))?;
        let intermediate = self
            .activation
            .apply(&self.intermediate.forward(&attended)?)?;
        self.output.forward(&intermediate, &attended)
    }
}

struct LmHead {
    dense: Linear,
    activation: HiddenAct,
    layer_norm: LayerNorm,
    decoder: Linear,
    bias: Tensor,
}

impl LmHead {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let transform = vb.pp("transform");
        Ok(Self {
            dense: linear(cfg.hidden_size, cfg.hidden_size, transform.pp("dense"))?,
            activation: cfg.hidden_act,
            layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                transform.pp("LayerNorm"),
            )?,
            decoder: linear(cfg.hidden_size, cfg.vocab_size, vb.pp("decoder"))?,
            bias: vb.get(cfg.vocab_size, "bias")?,
        })
    }

    fn forward(&self, hidden_states: &Tensor) -> candle_core::Result<Tensor> {
        let hidden_states = self
            .activation
            .apply(&self.dense.forward(hidden_states)?)?;
        let hidden_states = self.layer_norm.forward(&hidden_states)?;
        self.decoder.forward(&hidden_states)?.broadcast_add(&self.bias)
    }
}

/// `(batch, len)` keep-mask of ones and zeros to an additive `(batch, 1, 1, len)` mask.
fn expand_attention_mask(
    attention_mask: Option<&Tensor>,
    len: usize,
    device: &Device,
    dtype: DType,
) -> candle_core::Result<Tensor> {
    let mask = match attention_mask {
        Some(mask) => mask.to_dtype(dtype)?,
        None => Tensor::ones((1, len), dtype, device)?,
    };
    let extended = mask.unsqueeze(1)?.unsqueeze(1)?;
    (extended.ones_like()? - &extended)? * MASKED
}

/// Additive `(1, 1, len, len)` mask hiding later positions from earlier ones.
fn causal_mask(len: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { MASKED as f32 } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, len, len), device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, IndexOp, Tensor};

    use super::{causal_mask, expand_attention_mask};

    #[test]
    fn causal_mask_hides_future_positions() -> anyhow::Result<()> {
        let mask = causal_mask(3, &Device::Cpu, candle_core::DType::F32)?;
        let rows = mask.i((0, 0))?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0.0, -10000.0, -10000.0]);
        assert_eq!(rows[1], vec![0.0, 0.0, -10000.0]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn padding_positions_are_masked() -> anyhow::Result<()> {
        let keep = Tensor::new(&[[1f32, 1.0, 0.0]], &Device::Cpu)?;
        let mask = expand_attention_mask(Some(&keep), 3, &Device::Cpu, candle_core::DType::F32)?;
        assert_eq!(mask.dims(), &[1, 1, 1, 3]);
        assert_eq!(
            mask.i((0, 0, 0))?.to_vec1::<f32>()?,
            vec![0.0, 0.0, -10000.0]
        );
        Ok(())
    }
}
