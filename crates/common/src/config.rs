//! Training and model configuration.
//!
//! Both configs are serialised as JSON. Every field has a default so a minimal
//! `{}` file produces a working setup; missing fields in older files fall back
//! to their `#[serde(default)]` values.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::Device;
use serde::{Deserialize, Serialize};

// ── Enumerations ────────────────────────────────────────────────────────────

/// Parameter update rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam with decoupled weight decay.
    AdamW,
    /// Adam with L2 weight decay folded into the gradients.
    Adam,
    /// Momentum SGD (optionally Nesterov) with L2 weight decay.
    Sgd,
}

/// Learning-rate schedule, advanced once per optimiser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Cosine,
    Step,
    /// Linear warmup followed by linear decay to zero.
    Linear,
}

/// How per-class loss weights are derived from label counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeightMethod {
    Inverse,
    InverseSqrt,
    /// Class-Balanced Loss (Cui et al., 2019).
    EffectiveSamples,
}

// ── Augmentation ────────────────────────────────────────────────────────────

/// Mixed-sample augmentation knobs. Every training batch gets either Mixup
/// (with probability `mixup_prob`) or CutMix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mixup_prob")]
    pub mixup_prob: f64,
    /// Beta(α, α) concentration for Mixup. `0` disables mixing (λ = 1).
    #[serde(default = "default_mix_alpha")]
    pub mixup_alpha: f64,
    /// Beta(α, α) concentration for CutMix. `0` disables mixing (λ = 1).
    #[serde(default = "default_mix_alpha")]
    pub cutmix_alpha: f64,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mixup_prob: default_mixup_prob(),
            mixup_alpha: default_mix_alpha(),
            cutmix_alpha: default_mix_alpha(),
        }
    }
}

// ── TrainConfig ─────────────────────────────────────────────────────────────

/// All knobs of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // ── Task ────────────────────────────────────────────────────────────────
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Human-readable class names, used only in log lines.
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,

    // ── Loop ────────────────────────────────────────────────────────────────
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// `auto`, `cpu`, or `cuda:N`.
    #[serde(default = "default_device")]
    pub device: String,

    // ── Optimiser ───────────────────────────────────────────────────────────
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub nesterov: bool,
    /// Global L2 gradient clip. `<= 0` disables clipping.
    #[serde(default = "default_gradient_clip")]
    pub gradient_clip: f64,

    // ── Schedule ────────────────────────────────────────────────────────────
    #[serde(default = "default_scheduler")]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    /// StepLR period in optimiser steps.
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    // ── Loss ────────────────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub use_class_weights: bool,
    #[serde(default = "default_class_weight_method")]
    pub class_weight_method: ClassWeightMethod,
    #[serde(default = "default_effective_num_beta")]
    pub effective_num_beta: f64,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
    /// Contrastive softmax temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_contrastive_weight")]
    pub contrastive_weight: f64,
    #[serde(default)]
    pub augmentation: AugmentationConfig,

    // ── Early stopping / artifacts ──────────────────────────────────────────
    #[serde(default = "default_patience")]
    pub early_stop_patience: usize,
    #[serde(default)]
    pub early_stop_min_delta: f64,
    #[serde(default = "default_true")]
    pub save_every_epoch: bool,
    #[serde(default = "default_model_save_path")]
    pub model_save_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

fn default_true() -> bool {
    true
}
fn default_mixup_prob() -> f64 {
    0.5
}
fn default_mix_alpha() -> f64 {
    0.2
}
fn default_num_classes() -> usize {
    3
}
fn default_class_names() -> Vec<String> {
    vec!["negative".into(), "neutral".into(), "positive".into()]
}
fn default_num_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    32
}
fn default_seed() -> u64 {
    42
}
fn default_device() -> String {
    "auto".into()
}
fn default_optimizer() -> OptimizerKind {
    OptimizerKind::AdamW
}
fn default_learning_rate() -> f64 {
    2e-5
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_momentum() -> f64 {
    0.9
}
fn default_gradient_clip() -> f64 {
    1.0
}
fn default_scheduler() -> SchedulerKind {
    SchedulerKind::Linear
}
fn default_warmup_ratio() -> f64 {
    0.1
}
fn default_min_lr() -> f64 {
    1e-6
}
fn default_step_size() -> usize {
    1000
}
fn default_gamma() -> f64 {
    0.1
}
fn default_class_weight_method() -> ClassWeightMethod {
    ClassWeightMethod::Inverse
}
fn default_effective_num_beta() -> f64 {
    0.999
}
fn default_label_smoothing() -> f64 {
    0.1
}
fn default_temperature() -> f64 {
    0.07
}
fn default_contrastive_weight() -> f64 {
    0.1
}
fn default_patience() -> usize {
    3
}
fn default_model_save_path() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_result_dir() -> PathBuf {
    PathBuf::from("results")
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            class_names: default_class_names(),
            num_epochs: default_num_epochs(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            device: default_device(),
            optimizer: default_optimizer(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            momentum: default_momentum(),
            nesterov: false,
            gradient_clip: default_gradient_clip(),
            scheduler: default_scheduler(),
            warmup_ratio: default_warmup_ratio(),
            min_lr: default_min_lr(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            use_class_weights: true,
            class_weight_method: default_class_weight_method(),
            effective_num_beta: default_effective_num_beta(),
            label_smoothing: default_label_smoothing(),
            temperature: default_temperature(),
            contrastive_weight: default_contrastive_weight(),
            augmentation: AugmentationConfig::default(),
            early_stop_patience: default_patience(),
            early_stop_min_delta: 0.0,
            save_every_epoch: true,
            model_save_path: default_model_save_path(),
            log_dir: default_log_dir(),
            result_dir: default_result_dir(),
        }
    }
}

impl TrainConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse training config {}", path.display()))?;
        Ok(config)
    }

    /// Reject configurations the trainer cannot run.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_classes == 0 {
            bail!("num_classes must be positive");
        }
        if self.class_names.len() != self.num_classes {
            bail!(
                "class_names has {} entries but num_classes is {}",
                self.class_names.len(),
                self.num_classes
            );
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.num_epochs == 0 {
            bail!("num_epochs must be positive");
        }
        if self.learning_rate <= 0.0 {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            bail!("label_smoothing must be in [0, 1), got {}", self.label_smoothing);
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            bail!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio);
        }
        if self.class_weight_method == ClassWeightMethod::EffectiveSamples
            && !(self.effective_num_beta > 0.0 && self.effective_num_beta < 1.0)
        {
            bail!(
                "effective_num_beta must be in (0, 1), got {}",
                self.effective_num_beta
            );
        }
        if self.scheduler == SchedulerKind::Step && self.step_size == 0 {
            bail!("step_size must be positive for the step scheduler");
        }
        if self.temperature <= 0.0 {
            bail!("temperature must be positive, got {}", self.temperature);
        }
        let aug = &self.augmentation;
        if !(0.0..=1.0).contains(&aug.mixup_prob) {
            bail!("augmentation.mixup_prob must be in [0, 1], got {}", aug.mixup_prob);
        }
        if aug.mixup_alpha < 0.0 || aug.cutmix_alpha < 0.0 {
            bail!("augmentation alphas must be non-negative");
        }
        Ok(())
    }

    /// Total optimiser steps for a run with `batches_per_epoch` batches.
    pub fn total_steps(&self, batches_per_epoch: usize) -> usize {
        batches_per_epoch * self.num_epochs
    }

    /// Warmup steps for the linear schedule (truncated, like `int()`).
    pub fn warmup_steps(&self, batches_per_epoch: usize) -> usize {
        (self.total_steps(batches_per_epoch) as f64 * self.warmup_ratio) as usize
    }

    /// Display name for a class index, falling back to the index itself.
    pub fn class_name(&self, class: usize) -> String {
        self.class_names
            .get(class)
            .cloned()
            .unwrap_or_else(|| class.to_string())
    }

    /// Resolve the `device` string.
    pub fn resolve_device(&self) -> anyhow::Result<Device> {
        parse_device(&self.device)
    }
}

/// Parse `auto`, `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(spec: &str) -> anyhow::Result<Device> {
    let spec = spec.trim().to_ascii_lowercase();
    let device = match spec.as_str() {
        "auto" => Device::cuda_if_available(0)?,
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("invalid cuda ordinal in {other:?}"))?;
                Device::new_cuda(ordinal)?
            }
            None => bail!("unknown device {other:?} (expected auto, cpu or cuda:N)"),
        },
    };
    Ok(device)
}

// ── ModelConfig ─────────────────────────────────────────────────────────────

/// Hyper-parameters of the reference fusion classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (must match the tokeniser that produced `input_ids`).
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    /// Token embedding width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Shared text/image feature width.
    #[serde(default = "default_projection_dim")]
    pub projection_dim: usize,
    #[serde(default = "default_image_channels")]
    pub image_channels: usize,
    /// Images are square, `image_size × image_size`.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_vocab_size() -> usize {
    30522 // BERT uncased WordPiece
}
fn default_max_seq_len() -> usize {
    128
}
fn default_hidden_size() -> usize {
    256
}
fn default_projection_dim() -> usize {
    128
}
fn default_image_channels() -> usize {
    3
}
fn default_image_size() -> usize {
    224
}
fn default_dropout() -> f32 {
    0.1
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            max_seq_len: default_max_seq_len(),
            hidden_size: default_hidden_size(),
            projection_dim: default_projection_dim(),
            image_channels: default_image_channels(),
            image_size: default_image_size(),
            dropout: default_dropout(),
            num_classes: default_num_classes(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl ModelConfig {
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse model config {}", path.display()))?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
