//! Per-epoch history and the final `results.json`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::metrics::EvalResults;

pub const RESULTS_FILE: &str = "results.json";

/// Curves recorded once per completed epoch.
///
/// JSON has no encoding for NaN or infinity, so non-finite entries are
/// written as `null` and read back as NaN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    #[serde(with = "non_finite_as_null")]
    pub train_losses: Vec<f64>,
    #[serde(with = "non_finite_as_null")]
    pub val_losses: Vec<f64>,
    #[serde(with = "non_finite_as_null")]
    pub train_accuracies: Vec<f64>,
    #[serde(with = "non_finite_as_null")]
    pub val_accuracies: Vec<f64>,
    #[serde(with = "non_finite_as_null")]
    pub val_f1s: Vec<f64>,
    /// LR the scheduler will use for the next step, read at epoch end.
    #[serde(with = "non_finite_as_null")]
    pub learning_rates: Vec<f64>,
    /// `(mean, std)` of the modality gate over every training sample seen up
    /// to the end of each epoch.
    pub alpha_history: Vec<(f64, f64)>,
}

impl TrainingHistory {
    pub fn epochs(&self) -> usize {
        self.train_losses.len()
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub history: TrainingHistory,
    /// Lowest validation loss; `None` when no epoch improved on the start.
    pub best_val_loss: Option<f64>,
    /// 1-based epoch of the best validation loss; 0 when none improved.
    pub best_epoch: usize,
    pub epochs_run: usize,
    pub stopped_early: bool,
    /// Raw text-branch gate value of every training sample, in visit order.
    #[serde(default)]
    pub alpha_values: Vec<f32>,
    pub test_results: EvalResults,
    pub noise_test_results: Option<EvalResults>,
}

impl TrainingReport {
    /// Write `results.json` into `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create result dir {}", dir.display()))?;
        let path = dir.join(RESULTS_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
    }
}

mod non_finite_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| v.is_finite().then_some(*v))
            .collect::<Vec<Option<f64>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let values = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}
