//! Per-class loss weights for imbalanced label distributions.
//!
//! Weights are normalised so they sum to the number of classes, which keeps
//! the loss on the same scale as the unweighted one.

use anyhow::bail;
use candle_core::{Device, Tensor};

use mmsa_common::{BatchDataset, ClassWeightMethod, TrainConfig};

/// `bincount(labels, minlength = num_classes)`; out-of-range labels are an error.
pub fn label_counts(labels: &[u32], num_classes: usize) -> anyhow::Result<Vec<usize>> {
    let mut counts = vec![0usize; num_classes];
    for &label in labels {
        match counts.get_mut(label as usize) {
            Some(c) => *c += 1,
            None => bail!("label {label} out of range for {num_classes} classes"),
        }
    }
    Ok(counts)
}

/// Raw weights from counts, normalised to sum to `counts.len()`.
///
/// Classes with no samples get weight 0 instead of an infinite one.
pub fn class_weights(
    counts: &[usize],
    method: ClassWeightMethod,
    beta: f64,
) -> anyhow::Result<Vec<f64>> {
    if counts.iter().all(|&c| c == 0) {
        bail!("cannot derive class weights from an empty label distribution");
    }
    let raw: Vec<f64> = counts
        .iter()
        .map(|&n| {
            if n == 0 {
                return 0.0;
            }
            let n = n as f64;
            match method {
                ClassWeightMethod::Inverse => 1.0 / n,
                ClassWeightMethod::InverseSqrt => 1.0 / n.sqrt(),
                ClassWeightMethod::EffectiveSamples => (1.0 - beta) / (1.0 - beta.powf(n)),
            }
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    let k = counts.len() as f64;
    Ok(raw.iter().map(|w| w / sum * k).collect())
}

/// Derive the criterion weights for a training split, or `None` when class
/// weighting is disabled.
pub fn compute_class_weights(
    config: &TrainConfig,
    train: &dyn BatchDataset,
    device: &Device,
) -> anyhow::Result<Option<Tensor>> {
    if !config.use_class_weights {
        tracing::info!("Class weighting disabled");
        return Ok(None);
    }

    let labels = train.labels()?;
    let counts = label_counts(&labels, config.num_classes)?;
    tracing::info!(
        distribution = %format_distribution(config, &counts),
        "Training label distribution"
    );
    for (class, _) in counts.iter().enumerate().filter(|(_, n)| **n == 0) {
        tracing::warn!(
            class = %config.class_name(class),
            "Class absent from training split; its loss weight is 0"
        );
    }

    let weights = class_weights(
        &counts,
        config.class_weight_method,
        config.effective_num_beta,
    )?;
    tracing::info!(
        method = ?config.class_weight_method,
        beta = config.effective_num_beta,
        weights = ?weights,
        "Class weights"
    );

    let as_f32: Vec<f32> = weights.iter().map(|&w| w as f32).collect();
    Ok(Some(Tensor::from_vec(as_f32, config.num_classes, device)?))
}

/// `negative:12, neutral:3, positive:40`
pub fn format_distribution(config: &TrainConfig, counts: &[usize]) -> String {
    counts
        .iter()
        .enumerate()
        .map(|(class, n)| format!("{}:{n}", config.class_name(class)))
        .collect::<Vec<_>>()
        .join(", ")
}
