//! The seam between the trainer and whatever network it optimises.
//!
//! The trainer never inspects the architecture. It only needs logits, the
//! two per-modality feature vectors, and (optionally) the fusion gate.

use candle_core::{Result, Tensor};

/// Everything one forward pass hands back to the trainer.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(B, num_classes)` unnormalised scores.
    pub logits: Tensor,
    /// `(B, D)` text representation.
    pub text_features: Tensor,
    /// `(B, D)` image representation.
    pub image_features: Tensor,
    /// `(B, 1)` weight given to the text branch, if the model gates modalities.
    pub alpha: Option<Tensor>,
}

/// A text + image sentiment classifier.
pub trait MultimodalModel {
    /// * `input_ids` — `(B, L)` u32 token ids.
    /// * `attention_mask` — `(B, L)` u32, 1 for real tokens.
    /// * `images` — `(B, C, H, W)` f32.
    /// * `train` — enables dropout and other train-only behaviour.
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        images: &Tensor,
        train: bool,
    ) -> Result<ModelOutput>;

    /// Cross-modal alignment loss. `None` means the model has no contrastive
    /// objective and the trainer uses the classification loss alone.
    fn contrastive_loss(
        &self,
        _text_features: &Tensor,
        _image_features: &Tensor,
        _temperature: f64,
    ) -> Result<Option<Tensor>> {
        Ok(None)
    }
}
