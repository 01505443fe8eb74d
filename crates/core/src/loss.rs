//! Classification and contrastive losses.
//!
//! [`weighted_cross_entropy`] reproduces the usual framework semantics for a
//! class-weighted, label-smoothed cross-entropy with mean reduction:
//!
//! ```text
//! l_i  = (1 - ε) · w[y_i] · (-log p_{y_i})  +  ε / K · Σ_c w[c] · (-log p_c)
//! loss = Σ_i l_i / Σ_i w[y_i]
//! ```

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{loss, ops};

/// Class-weighted, label-smoothed cross-entropy.
///
/// * `logits` — `(B, K)`.
/// * `labels` — `(B,)` u32 class indices.
/// * `weights` — optional `(K,)` per-class weights; `None` means all ones.
pub fn weighted_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    weights: Option<&Tensor>,
    smoothing: f64,
) -> Result<Tensor> {
    let (total, denom) = weighted_cross_entropy_sums(logits, labels, weights, smoothing)?;
    total.div(&denom)
}

/// Numerator `Σ l_i` and denominator `Σ w[y_i]` of [`weighted_cross_entropy`],
/// for callers that reduce over more than one batch. The denominator is 0
/// when every label in the batch has weight 0.
pub fn weighted_cross_entropy_sums(
    logits: &Tensor,
    labels: &Tensor,
    weights: Option<&Tensor>,
    smoothing: f64,
) -> Result<(Tensor, Tensor)> {
    let (_, k) = logits.dims2()?;
    let labels = labels.to_dtype(DType::U32)?;
    let log_probs = ops::log_softmax(logits, D::Minus1)?;

    let w = match weights {
        Some(w) => w.to_dtype(log_probs.dtype())?,
        None => Tensor::ones(k, log_probs.dtype(), logits.device())?,
    };
    let w_target = w.index_select(&labels, 0)?;

    let nll = log_probs
        .gather(&labels.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let target_term = (nll * &w_target)?.sum_all()?;
    let denom = w_target.sum_all()?;

    let total = if smoothing > 0.0 {
        let smooth_term = log_probs
            .broadcast_mul(&w.unsqueeze(0)?)?
            .sum_all()?
            .neg()?;
        (target_term.affine(1.0 - smoothing, 0.0)? + smooth_term.affine(smoothing / k as f64, 0.0)?)?
    } else {
        target_term
    };
    Ok((total, denom))
}

/// Loss against two label sets blended by `lambda` (Mixup / CutMix):
/// `λ·CE(y_a) + (1-λ)·CE(y_b)`.
pub fn mixed_cross_entropy(
    logits: &Tensor,
    labels_a: &Tensor,
    labels_b: &Tensor,
    lambda: f64,
    weights: Option<&Tensor>,
    smoothing: f64,
) -> Result<Tensor> {
    let loss_a = weighted_cross_entropy(logits, labels_a, weights, smoothing)?;
    if lambda >= 1.0 {
        return Ok(loss_a);
    }
    let loss_b = weighted_cross_entropy(logits, labels_b, weights, smoothing)?;
    loss_a.affine(lambda, 0.0)? + loss_b.affine(1.0 - lambda, 0.0)?
}

/// Row-wise L2 normalisation.
fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-12)?;
    x.broadcast_div(&norm)
}

/// Symmetric InfoNCE between paired text and image features.
///
/// Row `i` of each side is the positive for row `i` of the other; every other
/// row in the batch is a negative.
pub fn info_nce_loss(
    text_features: &Tensor,
    image_features: &Tensor,
    temperature: f64,
) -> Result<Tensor> {
    let (b, _) = text_features.dims2()?;
    let t = l2_normalize(text_features)?;
    let i = l2_normalize(image_features)?;
    let logits = t
        .matmul(&i.t()?.contiguous()?)?
        .affine(1.0 / temperature, 0.0)?;
    let targets = arange_u32(b, text_features.device())?;
    let text_to_image = loss::cross_entropy(&logits, &targets)?;
    let image_to_text = loss::cross_entropy(&logits.t()?.contiguous()?, &targets)?;
    (text_to_image + image_to_text)?.affine(0.5, 0.0)
}

fn arange_u32(n: usize, device: &Device) -> Result<Tensor> {
    Tensor::arange(0u32, n as u32, device)
}
