//! Mixed-sample image augmentation: Mixup and CutMix.
//!
//! Both draw λ ~ Beta(α, α) and pair every sample with another one from a
//! random permutation of the batch. Only images are mixed; text stays with
//! the original sample. The targets come back as two label sets plus λ so the
//! loss can be blended (`λ·CE(y_a) + (1-λ)·CE(y_b)`).

use anyhow::Context;
use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

use mmsa_common::AugmentationConfig;

/// Which augmentation produced a [`MixedBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixKind {
    Mixup,
    CutMix,
}

/// Images after mixing plus the two label sets they blend.
#[derive(Debug, Clone)]
pub struct MixedBatch {
    pub images: Tensor,
    pub labels_a: Tensor,
    pub labels_b: Tensor,
    /// Share of the loss that belongs to `labels_a`.
    pub lambda: f64,
    pub kind: MixKind,
}

impl MixedBatch {
    /// Labels that dominate the mix, used for training accuracy.
    pub fn dominant_labels(&self) -> &Tensor {
        if self.lambda >= 0.5 {
            &self.labels_a
        } else {
            &self.labels_b
        }
    }
}

/// Half-open box `[row0, row1) × [col0, col1)` over the spatial dims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutBox {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

impl CutBox {
    pub fn area(&self) -> usize {
        (self.row1 - self.row0) * (self.col1 - self.col0)
    }
}

/// λ ~ Beta(α, α), or 1 when α is 0.
pub fn sample_lambda<R: Rng + ?Sized>(alpha: f64, rng: &mut R) -> anyhow::Result<f64> {
    if alpha <= 0.0 {
        return Ok(1.0);
    }
    let beta = Beta::new(alpha, alpha).context("invalid Beta concentration")?;
    Ok(beta.sample(rng))
}

/// Random box covering roughly `1 - λ` of an `height × width` image, centred
/// uniformly and clipped to the borders.
pub fn rand_bbox<R: Rng + ?Sized>(height: usize, width: usize, lambda: f64, rng: &mut R) -> CutBox {
    let cut_rat = (1.0 - lambda).max(0.0).sqrt();
    let cut_h = (height as f64 * cut_rat) as usize;
    let cut_w = (width as f64 * cut_rat) as usize;

    let cy = rng.gen_range(0..height.max(1));
    let cx = rng.gen_range(0..width.max(1));

    CutBox {
        row0: cy.saturating_sub(cut_h / 2).min(height),
        row1: (cy + cut_h / 2).min(height),
        col0: cx.saturating_sub(cut_w / 2).min(width),
        col1: (cx + cut_w / 2).min(width),
    }
}

fn shuffled_index<R: Rng + ?Sized>(
    batch_size: usize,
    device: &candle_core::Device,
    rng: &mut R,
) -> candle_core::Result<Tensor> {
    let mut perm: Vec<u32> = (0..batch_size as u32).collect();
    perm.shuffle(rng);
    Tensor::from_vec(perm, batch_size, device)
}

/// `x' = λ·x + (1-λ)·x[π]`.
pub fn mixup<R: Rng + ?Sized>(
    images: &Tensor,
    labels: &Tensor,
    alpha: f64,
    rng: &mut R,
) -> anyhow::Result<MixedBatch> {
    let lambda = sample_lambda(alpha, rng)?;
    let batch_size = images.dim(0)?;
    let index = shuffled_index(batch_size, images.device(), rng)?;

    let partner = images.index_select(&index, 0)?;
    let mixed = (images.affine(lambda, 0.0)? + partner.affine(1.0 - lambda, 0.0)?)?;

    Ok(MixedBatch {
        images: mixed,
        labels_a: labels.clone(),
        labels_b: labels.index_select(&index, 0)?,
        lambda,
        kind: MixKind::Mixup,
    })
}

/// Paste a box from `x[π]` into every image; λ becomes the unpasted share.
pub fn cutmix<R: Rng + ?Sized>(
    images: &Tensor,
    labels: &Tensor,
    alpha: f64,
    rng: &mut R,
) -> anyhow::Result<MixedBatch> {
    let lambda = sample_lambda(alpha, rng)?;
    let (batch_size, _, height, width) = images.dims4()?;
    let index = shuffled_index(batch_size, images.device(), rng)?;
    let cut = rand_bbox(height, width, lambda, rng);

    let mut mask = vec![0f32; height * width];
    for row in cut.row0..cut.row1 {
        mask[row * width + cut.col0..row * width + cut.col1].fill(1.0);
    }
    let mask = Tensor::from_vec(mask, (1, 1, height, width), images.device())?
        .to_dtype(images.dtype())?;
    let keep = mask.affine(-1.0, 1.0)?;

    let partner = images.index_select(&index, 0)?;
    let mixed = (images.broadcast_mul(&keep)? + partner.broadcast_mul(&mask)?)?;
    let lambda = 1.0 - cut.area() as f64 / (height * width).max(1) as f64;

    Ok(MixedBatch {
        images: mixed,
        labels_a: labels.clone(),
        labels_b: labels.index_select(&index, 0)?,
        lambda,
        kind: MixKind::CutMix,
    })
}

/// Chooses between Mixup and CutMix for each batch.
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Mix a batch, or pass it through untouched (λ = 1) when disabled.
    pub fn apply<R: Rng + ?Sized>(
        &self,
        images: &Tensor,
        labels: &Tensor,
        rng: &mut R,
    ) -> anyhow::Result<MixedBatch> {
        if !self.config.enabled {
            return Ok(MixedBatch {
                images: images.clone(),
                labels_a: labels.clone(),
                labels_b: labels.clone(),
                lambda: 1.0,
                kind: MixKind::Mixup,
            });
        }
        if rng.gen::<f64>() < self.config.mixup_prob {
            mixup(images, labels, self.config.mixup_alpha, rng)
        } else {
            cutmix(images, labels, self.config.cutmix_alpha, rng)
        }
    }
}
