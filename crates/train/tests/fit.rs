//! End-to-end runs of the epoch loop on a tiny synthetic split.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use mmsa_common::{BatchDataset, ModelConfig, TensorDataset, TrainConfig};
use mmsa_core::FusionClassifier;
use mmsa_train::{evaluate_model, Trainer, BEST_MODEL_FILE, RESULTS_FILE};

const SEQ_LEN: usize = 6;
const IMAGE_SIZE: usize = 8;

fn model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 32,
        max_seq_len: SEQ_LEN,
        hidden_size: 16,
        projection_dim: 8,
        image_channels: 3,
        image_size: IMAGE_SIZE,
        num_classes: 3,
        ..Default::default()
    }
}

/// `n` samples whose tokens and pixel intensity both depend on the label.
fn synthetic_split(n: usize, offset: u32) -> TensorDataset {
    let labels: Vec<u32> = (0..n as u32).map(|i| (i + offset) % 3).collect();
    split_with_labels(&labels)
}

fn split_with_labels(labels: &[u32]) -> TensorDataset {
    let dev = Device::Cpu;
    let n = labels.len();

    let mut ids = Vec::with_capacity(n * SEQ_LEN);
    let mut mask = Vec::with_capacity(n * SEQ_LEN);
    for (i, &y) in labels.iter().enumerate() {
        let real = SEQ_LEN - i % 3;
        for j in 0..SEQ_LEN {
            ids.push(if j < real { 1 + y * 10 + j as u32 } else { 0 });
            mask.push(u32::from(j < real));
        }
    }

    let plane = 3 * IMAGE_SIZE * IMAGE_SIZE;
    let mut pixels = Vec::with_capacity(n * plane);
    for &y in labels {
        pixels.extend(std::iter::repeat(y as f32 * 0.5 - 0.5).take(plane));
    }

    TensorDataset::new(
        Tensor::from_vec(ids, (n, SEQ_LEN), &dev).unwrap(),
        Tensor::from_vec(mask, (n, SEQ_LEN), &dev).unwrap(),
        Tensor::from_vec(pixels, (n, 3, IMAGE_SIZE, IMAGE_SIZE), &dev).unwrap(),
        Tensor::from_vec(labels.to_vec(), n, &dev).unwrap(),
    )
    .unwrap()
}

fn train_config(root: &Path, epochs: usize) -> TrainConfig {
    TrainConfig {
        num_epochs: epochs,
        batch_size: 4,
        learning_rate: 1e-2,
        device: "cpu".into(),
        model_save_path: root.join("checkpoints"),
        log_dir: root.join("logs"),
        result_dir: root.join("results"),
        ..Default::default()
    }
}

fn build(config: TrainConfig, train: &TensorDataset) -> Trainer<FusionClassifier> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = FusionClassifier::new(vb, &model_config()).unwrap();
    Trainer::new(model, varmap, config, train, Device::Cpu).unwrap()
}

#[test]
fn fit_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let config = train_config(dir.path(), 2);
    let train = synthetic_split(12, 0);
    let val = synthetic_split(6, 1);
    let test = synthetic_split(6, 2);
    let noisy = synthetic_split(5, 0);

    let mut trainer = build(config.clone(), &train);
    assert!(trainer.class_weights().is_some());

    let report = trainer.fit(&train, &val, &test, Some(&noisy)).unwrap();

    assert_eq!(report.epochs_run, 2);
    assert!(!report.stopped_early);
    assert!((1..=2).contains(&report.best_epoch));
    assert!(report.best_val_loss.unwrap().is_finite());
    assert_eq!(report.history.val_f1s.len(), 2);
    assert_eq!(report.history.learning_rates.len(), 2);
    // The fusion gate reports a weight for every training sample.
    assert_eq!(report.history.alpha_history.len(), 2);
    for (mean, _) in &report.history.alpha_history {
        assert!((0.0..=1.0).contains(mean));
    }
    assert_eq!(trainer.global_step(), 2 * train.num_batches(4));

    assert_eq!(report.test_results.predictions.len(), test.len());
    let noisy_results = report.noise_test_results.as_ref().unwrap();
    assert_eq!(noisy_results.labels.len(), noisy.len());

    let ckpt = &config.model_save_path;
    assert!(ckpt.join(BEST_MODEL_FILE).exists());
    assert!(ckpt.join("model_epoch_1.safetensors").exists());
    assert!(ckpt.join("model_epoch_2.safetensors").exists());

    let plots = config.result_dir.join("plots");
    assert!(plots.join("loss_curve.svg").exists());
    assert!(plots.join("accuracy_curve.svg").exists());
    assert!(plots.join("modal_weights_epoch_1.svg").exists());
    assert!(plots.join("modal_weights_epoch_2.svg").exists());
    assert!(config.result_dir.join(RESULTS_FILE).exists());
}

#[test]
fn linear_warmup_reaches_peak_then_decays() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = train_config(dir.path(), 2);
    config.augmentation.enabled = false;
    config.save_every_epoch = false;
    // 12 samples / 4 per batch = 3 steps per epoch, 6 total, warmup 3.
    config.warmup_ratio = 0.5;
    let train = synthetic_split(12, 0);
    let val = synthetic_split(3, 0);

    let mut trainer = build(config.clone(), &train);
    let report = trainer.fit(&train, &val, &val, None).unwrap();

    let lrs = &report.history.learning_rates;
    assert!((lrs[0] - config.learning_rate).abs() < 1e-12);
    assert!(lrs[1].abs() < 1e-12);
    assert!(!config.model_save_path.join("model_epoch_1.safetensors").exists());
}

#[test]
fn empty_validation_split_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let train = synthetic_split(4, 0);
    let empty = synthetic_split(0, 0);
    let mut trainer = build(train_config(dir.path(), 1), &train);
    assert!(trainer.fit(&train, &empty, &train, None).is_err());
}

#[test]
fn empty_training_split_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let empty = synthetic_split(0, 0);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = FusionClassifier::new(vb, &model_config()).unwrap();
    let result = Trainer::new(
        model,
        varmap,
        train_config(dir.path(), 1),
        &empty,
        Device::Cpu,
    );
    assert!(result.is_err());
}

fn max_abs_diff(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
    a.iter()
        .flatten()
        .zip(b.iter().flatten())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

fn load_fusion(path: &Path) -> FusionClassifier {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = FusionClassifier::new(vb, &model_config()).unwrap();
    varmap.load(path).unwrap();
    model
}

#[test]
fn class_absent_from_training_keeps_validation_loss_finite() {
    let dir = tempfile::tempdir().unwrap();
    let config = train_config(dir.path(), 2);
    let train = split_with_labels(&[0, 1, 0, 1, 0, 1, 0, 1]);
    // The second validation batch holds only the class training never saw.
    let val = split_with_labels(&[0, 1, 0, 1, 2, 2, 2, 2]);

    let mut trainer = build(config.clone(), &train);
    let weights = trainer.class_weights().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(weights[2], 0.0);

    let report = trainer.fit(&train, &val, &val, None).unwrap();
    assert!(report.history.val_losses.iter().all(|l| l.is_finite()));
    assert!(report.best_epoch >= 1);
    assert!(report.best_val_loss.is_some());
    assert!(config.model_save_path.join(BEST_MODEL_FILE).exists());
}

#[test]
fn early_stop_skips_artifacts_of_the_stopping_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = train_config(dir.path(), 5);
    config.early_stop_patience = 1;
    // Only the first epoch can beat +inf by this margin.
    config.early_stop_min_delta = 1e9;
    let train = synthetic_split(8, 0);
    let val = synthetic_split(3, 0);

    let mut trainer = build(config.clone(), &train);
    let report = trainer.fit(&train, &val, &val, None).unwrap();

    assert!(report.stopped_early);
    assert_eq!(report.epochs_run, 2);
    assert_eq!(report.best_epoch, 1);

    let ckpt = &config.model_save_path;
    let plots = config.result_dir.join("plots");
    assert!(ckpt.join("model_epoch_1.safetensors").exists());
    assert!(plots.join("modal_weights_epoch_1.svg").exists());
    assert!(!ckpt.join("model_epoch_2.safetensors").exists());
    assert!(!plots.join("modal_weights_epoch_2.svg").exists());
    assert_eq!(report.history.alpha_history.len(), 1);
}

#[test]
fn test_split_is_scored_with_best_weights() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = train_config(dir.path(), 2);
    config.learning_rate = 5e-2;
    config.early_stop_patience = 3;
    config.early_stop_min_delta = 1e9;
    let train = synthetic_split(12, 0);
    let val = synthetic_split(6, 1);
    let test = synthetic_split(6, 2);

    let mut trainer = build(config.clone(), &train);
    let report = trainer.fit(&train, &val, &test, None).unwrap();
    assert_eq!(report.best_epoch, 1);
    assert!(!report.stopped_early);

    let ckpt = &config.model_save_path;
    let score = |path: &Path| {
        let model = load_fusion(path);
        evaluate_model(&model, &test, "test", 3, config.batch_size, &Device::Cpu)
            .unwrap()
            .probabilities
    };
    let best = score(&ckpt.join(BEST_MODEL_FILE));
    let last = score(&ckpt.join("model_epoch_2.safetensors"));

    assert!(max_abs_diff(&report.test_results.probabilities, &best) < 1e-6);
    assert!(max_abs_diff(&report.test_results.probabilities, &last) > 1e-6);
}

#[test]
fn fit_rejects_a_different_training_split() {
    let dir = tempfile::tempdir().unwrap();
    let train = synthetic_split(8, 0);
    let other = synthetic_split(12, 0);
    let val = synthetic_split(3, 0);
    let mut trainer = build(train_config(dir.path(), 1), &train);
    assert!(trainer.fit(&other, &val, &val, None).is_err());
}
