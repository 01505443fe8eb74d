mod logging;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};

use mmsa_common::{BatchDataset, ModelConfig, TensorDataset, TrainConfig};
use mmsa_core::FusionClassifier;
use mmsa_train::{evaluate_model, Trainer};

const MODEL_CONFIG_FILE: &str = "model_config.json";

#[derive(Parser, Debug)]
#[command(name = "mmsa", about = "Multimodal sentiment analysis training harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write default training (and optionally model) configs.
    InitConfig(InitConfigArgs),
    /// Train the fusion classifier and evaluate the best checkpoint.
    Train(TrainArgs),
    /// Evaluate a checkpoint on one split.
    Evaluate(EvaluateArgs),
}

// ── Init ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "train_config.json")]
    output: PathBuf,
    #[arg(long)]
    model_config: Option<PathBuf>,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Training config; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    model_config: Option<PathBuf>,
    /// Splits as safetensors files with input_ids / attention_mask / images / labels.
    #[arg(long)]
    train: PathBuf,
    #[arg(long)]
    val: PathBuf,
    #[arg(long)]
    test: PathBuf,
    #[arg(long)]
    noisy_test: Option<PathBuf>,
    #[command(flatten)]
    overrides: Overrides,
}

/// Command-line overrides applied on top of the config file.
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    /// `auto`, `cpu`, `cuda` or `cuda:N`.
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut TrainConfig) {
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        if let Some(device) = &self.device {
            config.device = device.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
    }
}

// ── Evaluate ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvaluateArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    model_config: Option<PathBuf>,
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value = "test")]
    name: String,
    #[arg(long)]
    device: Option<String>,
}

// ── Main ───────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => run_init_config(args),
        Command::Train(args) => run_train(args),
        Command::Evaluate(args) => run_evaluate(args),
    }
}

fn run_init_config(args: InitConfigArgs) -> Result<()> {
    logging::init(None)?;
    TrainConfig::default().save(&args.output)?;
    tracing::info!(path = %args.output.display(), "Wrote training config");
    if let Some(path) = &args.model_config {
        ModelConfig::default().save(path)?;
        tracing::info!(path = %path.display(), "Wrote model config");
    }
    Ok(())
}

fn run_train(args: TrainArgs) -> Result<()> {
    let mut config = load_train_config(args.config.as_deref())?;
    args.overrides.apply(&mut config);
    config.validate()?;

    logging::init(Some(&config.log_dir))?;
    let device = config.resolve_device()?;
    let model_config = load_model_config(args.model_config.as_deref(), &config)?;

    let train = load_split(&args.train, &device, &model_config)?;
    let val = load_split(&args.val, &device, &model_config)?;
    let test = load_split(&args.test, &device, &model_config)?;
    let noisy_test = args
        .noisy_test
        .as_deref()
        .map(|p| load_split(p, &device, &model_config))
        .transpose()?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = FusionClassifier::new(vb, &model_config)?;

    std::fs::create_dir_all(&config.model_save_path)?;
    model_config.save(&config.model_save_path.join(MODEL_CONFIG_FILE))?;
    config.save(&config.model_save_path.join("train_config.json"))?;

    let mut trainer = Trainer::new(model, varmap, config, &train, device)?;
    let report = trainer.fit(
        &train,
        &val,
        &test,
        noisy_test.as_ref().map(|d| d as &dyn BatchDataset),
    )?;

    let summary = serde_json::json!({
        "epochs_run": report.epochs_run,
        "best_epoch": report.best_epoch,
        "best_val_loss": report.best_val_loss,
        "stopped_early": report.stopped_early,
        "test": summary_json(&report.test_results),
        "noisy_test": report.noise_test_results.as_ref().map(summary_json),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_evaluate(args: EvaluateArgs) -> Result<()> {
    logging::init(None)?;
    let mut config = load_train_config(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.device = device;
    }
    let device = config.resolve_device()?;

    let model_config_path = args.model_config.clone().or_else(|| {
        let sibling = args.checkpoint.with_file_name(MODEL_CONFIG_FILE);
        sibling.exists().then_some(sibling)
    });
    let model_config = load_model_config(model_config_path.as_deref(), &config)?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = FusionClassifier::new(vb, &model_config)?;
    varmap.load(&args.checkpoint)?;
    tracing::info!(path = %args.checkpoint.display(), "Loaded checkpoint");

    let data = load_split(&args.data, &device, &model_config)?;
    let results = evaluate_model(
        &model,
        &data,
        &args.name,
        config.num_classes,
        config.batch_size,
        &device,
    )?;
    println!("{}", serde_json::to_string_pretty(&summary_json(&results))?);
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn load_train_config(path: Option<&Path>) -> Result<TrainConfig> {
    match path {
        Some(p) => TrainConfig::load(p),
        None => Ok(TrainConfig::default()),
    }
}

fn load_model_config(path: Option<&Path>, config: &TrainConfig) -> Result<ModelConfig> {
    let model_config = match path {
        Some(p) => ModelConfig::load(p)?,
        None => ModelConfig {
            num_classes: config.num_classes,
            ..Default::default()
        },
    };
    if model_config.num_classes != config.num_classes {
        bail!(
            "model has {} classes but training config has {}",
            model_config.num_classes,
            config.num_classes
        );
    }
    Ok(model_config)
}

fn load_split(path: &Path, device: &Device, model_config: &ModelConfig) -> Result<TensorDataset> {
    let ds = TensorDataset::load(path, device)?;
    let (channels, _, _) = ds.image_dims();
    if channels != model_config.image_channels {
        bail!(
            "{}: images have {channels} channels, model expects {}",
            path.display(),
            model_config.image_channels
        );
    }
    tracing::info!(path = %path.display(), samples = ds.len(), "Loaded split");
    Ok(ds)
}

fn summary_json(results: &mmsa_train::EvalResults) -> serde_json::Value {
    serde_json::json!({
        "name": results.name,
        "samples": results.labels.len(),
        "accuracy": results.accuracy,
        "f1": results.f1,
        "auc": results.auc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut config = TrainConfig::default();
        let overrides = Overrides {
            epochs: Some(2),
            lr: Some(1e-3),
            device: Some("cpu".into()),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.num_epochs, 2);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.device, "cpu");
        assert_eq!(config.batch_size, TrainConfig::default().batch_size);
    }

    #[test]
    fn cli_parses_train_flags() {
        let cli = Cli::try_parse_from([
            "mmsa", "train", "--train", "a.safetensors", "--val", "b.safetensors", "--test",
            "c.safetensors", "--epochs", "3", "--batch-size", "8",
        ])
        .unwrap();
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.overrides.epochs, Some(3));
                assert_eq!(args.overrides.batch_size, Some(8));
                assert!(args.noisy_test.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn mismatched_class_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        ModelConfig {
            num_classes: 2,
            ..Default::default()
        }
        .save(&path)
        .unwrap();
        assert!(load_model_config(Some(&path), &TrainConfig::default()).is_err());
        assert_eq!(
            load_model_config(None, &TrainConfig::default())
                .unwrap()
                .num_classes,
            3
        );
    }
}
