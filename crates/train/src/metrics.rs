//! Classification metrics: accuracy, macro-F1, one-vs-rest macro ROC-AUC.

use std::collections::BTreeSet;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Results of evaluating one split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResults {
    pub name: String,
    pub accuracy: f64,
    /// Macro-averaged F1.
    pub f1: f64,
    /// Macro one-vs-rest ROC-AUC; 0 when undefined for the split.
    pub auc: f64,
    pub predictions: Vec<u32>,
    pub labels: Vec<u32>,
    pub probabilities: Vec<Vec<f32>>,
}

pub fn accuracy(predictions: &[u32], labels: &[u32]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f64 / labels.len() as f64
}

/// F1 averaged over every class that appears in either the predictions or the
/// labels. A class with zero precision and recall contributes 0.
pub fn macro_f1(predictions: &[u32], labels: &[u32]) -> f64 {
    let classes: BTreeSet<u32> = predictions.iter().chain(labels).copied().collect();
    if classes.is_empty() {
        return 0.0;
    }
    let total: f64 = classes
        .iter()
        .map(|&c| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (&p, &l) in predictions.iter().zip(labels) {
                match (p == c, l == c) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, true) => fn_ += 1,
                    (false, false) => {}
                }
            }
            let denom = 2 * tp + fp + fn_;
            if denom == 0 {
                0.0
            } else {
                2.0 * tp as f64 / denom as f64
            }
        })
        .sum();
    total / classes.len() as f64
}

/// Binary ROC-AUC via the Mann–Whitney statistic with averaged tie ranks.
/// `None` when either class is missing.
pub fn binary_auc(scores: &[f32], positive: &[bool]) -> Option<f64> {
    let n_pos = positive.iter().filter(|&&p| p).count();
    let n_neg = positive.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0f64;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; ties share the mean of their ranks.
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if positive[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Macro one-vs-rest ROC-AUC. Fails when some class has no positive or no
/// negative sample in `labels`.
pub fn roc_auc_ovr_macro(
    labels: &[u32],
    probabilities: &[Vec<f32>],
    num_classes: usize,
) -> anyhow::Result<f64> {
    if labels.len() != probabilities.len() {
        bail!(
            "{} labels but {} probability rows",
            labels.len(),
            probabilities.len()
        );
    }
    if num_classes == 0 {
        bail!("no classes");
    }
    let mut total = 0.0;
    for class in 0..num_classes {
        let scores = probabilities
            .iter()
            .map(|row| row.get(class).copied())
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| anyhow::anyhow!("probability row shorter than {num_classes}"))?;
        let positive: Vec<bool> = labels.iter().map(|&l| l as usize == class).collect();
        match binary_auc(&scores, &positive) {
            Some(auc) => total += auc,
            None => bail!(
                "ROC-AUC undefined: class {class} has only one label value in the split"
            ),
        }
    }
    Ok(total / num_classes as f64)
}

/// Per-class label counts, at least `num_classes` long.
pub fn label_distribution(labels: &[u32], num_classes: usize) -> Vec<usize> {
    let len = labels
        .iter()
        .map(|&l| l as usize + 1)
        .max()
        .unwrap_or(0)
        .max(num_classes);
    let mut counts = vec![0usize; len];
    for &l in labels {
        counts[l as usize] += 1;
    }
    counts
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}
