//! Reference gated-fusion classifier.
//!
//! Small enough to train on a CPU, complete enough to exercise every trainer
//! path (gate values, contrastive head, dropout):
//!
//! ```text
//! text:  embed → masked mean-pool → LayerNorm → proj ─┐
//!                                                     ├─ α = σ(W[t; i]) → α·t + (1-α)·i → dropout → head
//! image: conv s2 → ReLU → conv s2 → ReLU → GAP → proj ┘
//! ```

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{
    conv2d, embedding, layer_norm, linear, ops, Conv2d, Conv2dConfig, Dropout, Embedding,
    LayerNorm, Linear, Module, VarBuilder,
};

use mmsa_common::ModelConfig;

use crate::loss::info_nce_loss;
use crate::model::{ModelOutput, MultimodalModel};

const CONV1_CHANNELS: usize = 16;
const CONV2_CHANNELS: usize = 32;

// ── Text branch ─────────────────────────────────────────────────────────────

struct TextEncoder {
    wte: Embedding,
    ln: LayerNorm,
    proj: Linear,
}

impl TextEncoder {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            wte: embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?,
            ln: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("ln"))?,
            proj: linear(config.hidden_size, config.projection_dim, vb.pp("proj"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let emb = self.wte.forward(input_ids)?; // (B, L, H)
        let mask = attention_mask.to_dtype(emb.dtype())?.unsqueeze(2)?; // (B, L, 1)
        let summed = emb.broadcast_mul(&mask)?.sum(1)?; // (B, H)
        let count = mask.sum(1)?.maximum(1.0)?; // (B, 1)
        let pooled = summed.broadcast_div(&count)?;
        self.proj.forward(&self.ln.forward(&pooled)?)
    }
}

// ── Image branch ────────────────────────────────────────────────────────────

struct ImageEncoder {
    conv1: Conv2d,
    conv2: Conv2d,
    proj: Linear,
}

impl ImageEncoder {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv2d(config.image_channels, CONV1_CHANNELS, 3, cfg, vb.pp("conv1"))?,
            conv2: conv2d(CONV1_CHANNELS, CONV2_CHANNELS, 3, cfg, vb.pp("conv2"))?,
            proj: linear(CONV2_CHANNELS, config.projection_dim, vb.pp("proj"))?,
        })
    }

    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(images)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        // Global average pool over (H, W).
        let pooled = x.mean(D::Minus1)?.mean(D::Minus1)?;
        self.proj.forward(&pooled)
    }
}

// ── FusionClassifier ────────────────────────────────────────────────────────

/// Gated late-fusion classifier over text and image features.
pub struct FusionClassifier {
    text: TextEncoder,
    image: ImageEncoder,
    gate: Linear,
    dropout: Dropout,
    head: Linear,
    config: ModelConfig,
}

impl FusionClassifier {
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let d = config.projection_dim;
        Ok(Self {
            text: TextEncoder::new(config, vb.pp("text"))?,
            image: ImageEncoder::new(config, vb.pp("image"))?,
            gate: linear(2 * d, 1, vb.pp("gate"))?,
            dropout: Dropout::new(config.dropout),
            head: linear(d, config.num_classes, vb.pp("head"))?,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }
}

impl MultimodalModel for FusionClassifier {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        images: &Tensor,
        train: bool,
    ) -> Result<ModelOutput> {
        let images = images.to_dtype(DType::F32)?;
        let text_features = self.text.forward(input_ids, attention_mask)?;
        let image_features = self.image.forward(&images)?;

        let joint = Tensor::cat(&[&text_features, &image_features], 1)?;
        let alpha = ops::sigmoid(&self.gate.forward(&joint)?)?; // (B, 1)
        let fused = (text_features.broadcast_mul(&alpha)?
            + image_features.broadcast_mul(&alpha.affine(-1.0, 1.0)?)?)?;
        let fused = self.dropout.forward(&fused, train)?;
        let logits = self.head.forward(&fused)?;

        Ok(ModelOutput {
            logits,
            text_features,
            image_features,
            alpha: Some(alpha),
        })
    }

    fn contrastive_loss(
        &self,
        text_features: &Tensor,
        image_features: &Tensor,
        temperature: f64,
    ) -> Result<Option<Tensor>> {
        info_nce_loss(text_features, image_features, temperature).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 50,
            max_seq_len: 6,
            hidden_size: 16,
            projection_dim: 8,
            image_channels: 3,
            image_size: 8,
            dropout: 0.1,
            num_classes: 3,
            layer_norm_eps: 1e-5,
        }
    }

    #[test]
    fn forward_shapes_and_gate_range() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FusionClassifier::new(vb, &tiny_config()).unwrap();

        let ids = Tensor::new(&[[1u32, 2, 3, 0, 0, 0], [4, 5, 6, 7, 8, 9]], &dev).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1, 0, 0, 0], [1, 1, 1, 1, 1, 1]], &dev).unwrap();
        let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &dev).unwrap();

        let out = model.forward(&ids, &mask, &images, false).unwrap();
        assert_eq!(out.logits.dims(), &[2, 3]);
        assert_eq!(out.text_features.dims(), &[2, 8]);
        assert_eq!(out.image_features.dims(), &[2, 8]);
        let alpha = out.alpha.unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(alpha.len(), 2);
        assert!(alpha.iter().all(|&a| a > 0.0 && a < 1.0));
    }

    #[test]
    fn padding_tokens_do_not_change_text_features() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FusionClassifier::new(vb, &tiny_config()).unwrap();

        let mask = Tensor::new(&[[1u32, 1, 0, 0, 0, 0]], &dev).unwrap();
        let a = Tensor::new(&[[3u32, 4, 0, 0, 0, 0]], &dev).unwrap();
        let b = Tensor::new(&[[3u32, 4, 9, 9, 9, 9]], &dev).unwrap();
        let images = Tensor::zeros((1, 3, 8, 8), DType::F32, &dev).unwrap();

        let fa = model.forward(&a, &mask, &images, false).unwrap().text_features;
        let fb = model.forward(&b, &mask, &images, false).unwrap().text_features;
        let diff = (fa - fb).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn provides_contrastive_loss() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FusionClassifier::new(vb, &tiny_config()).unwrap();
        let t = Tensor::randn(0f32, 1.0, (4, 8), &dev).unwrap();
        let i = Tensor::randn(0f32, 1.0, (4, 8), &dev).unwrap();
        let l = model.contrastive_loss(&t, &i, 0.07).unwrap().unwrap();
        assert!(l.to_scalar::<f32>().unwrap().is_finite());
    }
}
