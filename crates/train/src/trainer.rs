//! Trainer: the epoch loop for a [`MultimodalModel`].
//!
//! Decouples the compute graph (forward + losses) from the optimisation step
//! (backward, gradient clipping, optimiser, schedule advance) and from the
//! per-epoch bookkeeping (validation, early stopping, checkpoints, plots).

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var, D};
use candle_nn::{ops, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use mmsa_common::{Batch, BatchDataset, TrainConfig};
use mmsa_core::{mixed_cross_entropy, weighted_cross_entropy_sums, MultimodalModel};

use crate::augment::Augmenter;
use crate::checkpoint::CheckpointManager;
use crate::class_weights::{compute_class_weights, format_distribution};
use crate::early_stop::{EarlyStopping, EpochVerdict};
use crate::metrics::{
    accuracy, label_distribution, macro_f1, mean_std, roc_auc_ovr_macro, EvalResults,
};
use crate::optim::ParamOptimizer;
use crate::plots::{self, Series, COLOR_TRAIN, COLOR_VAL};
use crate::report::{TrainingHistory, TrainingReport};
use crate::scheduler::LrScheduler;

const HISTOGRAM_BINS: usize = 20;

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    /// Total loss (classification + weighted contrastive).
    pub loss: f32,
    pub classification_loss: f32,
    pub contrastive_loss: Option<f32>,
    /// LR used for this step.
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub batch_size: usize,
    /// Predictions matching the dominant mixed label.
    pub correct: usize,
    pub alpha: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct ValidationMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub distribution: Vec<usize>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser and all schedules.
pub struct Trainer<M: MultimodalModel> {
    model: M,
    varmap: VarMap,
    vars: Vec<Var>,
    optimizer: ParamOptimizer,
    lr_scheduler: LrScheduler,
    class_weights: Option<Tensor>,
    augmenter: Augmenter,
    early_stopping: EarlyStopping,
    checkpoints: CheckpointManager,
    history: TrainingHistory,
    alpha_values: Vec<f32>,
    /// Size of the split class weights and the LR horizon were derived from.
    train_len: usize,
    rng: StdRng,
    config: TrainConfig,
    device: Device,
    global_step: usize,
}

impl<M: MultimodalModel> Trainer<M> {
    /// `varmap` must hold every trainable variable of `model`. Class weights
    /// and the LR horizon are derived from `train`.
    pub fn new(
        model: M,
        varmap: VarMap,
        config: TrainConfig,
        train: &dyn BatchDataset,
        device: Device,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if train.is_empty() {
            anyhow::bail!("training split is empty");
        }

        let vars = varmap.all_vars();
        let num_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        let batches_per_epoch = train.num_batches(config.batch_size);

        let class_weights = compute_class_weights(&config, train, &device)?;
        let optimizer = ParamOptimizer::from_config(&config, vars.clone())?;
        let lr_scheduler = LrScheduler::from_config(&config, batches_per_epoch);
        let checkpoints = CheckpointManager::new(&config.model_save_path)?;

        tracing::info!(
            device = ?device,
            num_params,
            epochs = config.num_epochs,
            batches_per_epoch,
            batch_size = config.batch_size,
            lr = config.learning_rate,
            optimizer = ?config.optimizer,
            scheduler = ?config.scheduler,
            total_steps = lr_scheduler.total_steps(),
            "Trainer ready"
        );

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            lr_scheduler,
            class_weights,
            augmenter: Augmenter::new(config.augmentation.clone()),
            early_stopping: EarlyStopping::new(
                config.early_stop_patience,
                config.early_stop_min_delta,
            ),
            checkpoints,
            history: TrainingHistory::default(),
            alpha_values: Vec::new(),
            train_len: train.len(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            device,
            global_step: 0,
        })
    }

    /// One optimiser step on one batch.
    pub fn train_step(&mut self, batch: &Batch) -> anyhow::Result<StepMetrics> {
        let batch = to_device(batch, &self.device)?;
        let batch_size = batch.len();

        let mixed = self
            .augmenter
            .apply(&batch.images, &batch.labels, &mut self.rng)?;
        let out = self.model.forward(
            &batch.input_ids,
            &batch.attention_mask,
            &mixed.images,
            true,
        )?;

        let classification = mixed_cross_entropy(
            &out.logits,
            &mixed.labels_a,
            &mixed.labels_b,
            mixed.lambda,
            self.class_weights.as_ref(),
            self.config.label_smoothing,
        )?;
        let contrastive = if self.config.contrastive_weight > 0.0 {
            self.model.contrastive_loss(
                &out.text_features,
                &out.image_features,
                self.config.temperature,
            )?
        } else {
            None
        };
        let loss = match &contrastive {
            Some(c) => (&classification + c.affine(self.config.contrastive_weight, 0.0)?)?,
            None => classification.clone(),
        };

        // Backward
        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = loss.backward()?;

        let grad_norm = if self.config.gradient_clip > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, self.config.gradient_clip)?
        } else {
            grad_norm(&grads, &self.vars)?
        };

        // Optimiser step
        self.optimizer.step(&mut grads)?;
        self.lr_scheduler.advance();
        self.global_step += 1;

        let correct = count_correct(&out.logits, mixed.dominant_labels())?;
        let alpha = match &out.alpha {
            Some(a) => a.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
            None => Vec::new(),
        };

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            classification_loss: classification.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            contrastive_loss: contrastive
                .map(|c| c.to_dtype(DType::F32)?.to_scalar::<f32>())
                .transpose()?,
            lr,
            grad_norm,
            batch_size,
            correct,
            alpha,
        })
    }

    /// One shuffled pass over `train`.
    pub fn train_epoch(
        &mut self,
        train: &dyn BatchDataset,
        epoch: usize,
    ) -> anyhow::Result<EpochMetrics> {
        let mut order: Vec<u32> = (0..train.len() as u32).collect();
        order.shuffle(&mut self.rng);

        let pb = progress_bar(
            train.num_batches(self.config.batch_size),
            &format!("epoch {}", epoch + 1),
        )?;

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut samples = 0usize;
        for batch in train.batches(self.config.batch_size, Some(order.as_slice())) {
            let metrics = self.train_step(&batch?)?;
            loss_sum += metrics.loss as f64 * metrics.batch_size as f64;
            correct += metrics.correct;
            samples += metrics.batch_size;
            self.alpha_values.extend_from_slice(&metrics.alpha);

            tracing::debug!(
                step = metrics.step,
                loss = format!("{:.4}", metrics.loss),
                cls = format!("{:.4}", metrics.classification_loss),
                contrastive = ?metrics.contrastive_loss,
                lr = format!("{:.2e}", metrics.lr),
                grad_norm = format!("{:.3}", metrics.grad_norm),
                "Step"
            );
            pb.set_message(format!("loss {:.4}", metrics.loss));
            pb.inc(1);
        }
        pb.finish_and_clear();

        if samples == 0 {
            anyhow::bail!("training split produced no samples");
        }
        Ok(EpochMetrics {
            loss: loss_sum / samples as f64,
            accuracy: correct as f64 / samples as f64,
            samples,
        })
    }

    /// Loss under the training criterion, accuracy and macro-F1.
    ///
    /// The weighted loss is reduced over the whole split, so batches made only
    /// of zero-weight classes contribute their smoothing term but do not
    /// divide by zero.
    pub fn validate(&self, val: &dyn BatchDataset) -> anyhow::Result<ValidationMetrics> {
        let mut loss_sum = 0.0f64;
        let mut weight_sum = 0.0f64;
        let mut predictions = Vec::with_capacity(val.len());
        let mut labels = Vec::with_capacity(val.len());

        for batch in val.batches(self.config.batch_size, None) {
            let batch = to_device(&batch?, &self.device)?;
            let out = self.model.forward(
                &batch.input_ids,
                &batch.attention_mask,
                &batch.images,
                false,
            )?;
            let (total, denom) = weighted_cross_entropy_sums(
                &out.logits,
                &batch.labels,
                self.class_weights.as_ref(),
                self.config.label_smoothing,
            )?;
            let total = total.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            let denom = denom.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            loss_sum += total;
            weight_sum += denom;
            predictions.extend(out.logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
            labels.extend(batch.labels.to_vec1::<u32>()?);
        }

        if labels.is_empty() {
            anyhow::bail!("validation split is empty");
        }
        if weight_sum <= 0.0 {
            anyhow::bail!(
                "every validation label has class weight 0; \
                 the validation split shares no class with the training split"
            );
        }
        let distribution = label_distribution(&labels, self.config.num_classes);
        tracing::info!(
            distribution = %format_distribution(&self.config, &distribution),
            "Validation label distribution"
        );

        Ok(ValidationMetrics {
            loss: loss_sum / weight_sum,
            accuracy: accuracy(&predictions, &labels),
            f1: macro_f1(&predictions, &labels),
            distribution,
        })
    }

    /// Accuracy, macro-F1 and macro one-vs-rest AUC on a split.
    pub fn evaluate(&self, dataset: &dyn BatchDataset, name: &str) -> anyhow::Result<EvalResults> {
        evaluate_model(
            &self.model,
            dataset,
            name,
            self.config.num_classes,
            self.config.batch_size,
            &self.device,
        )
    }

    /// Full run: epochs with early stopping, then test evaluation with the
    /// best weights. Writes checkpoints, plots and `results.json`.
    ///
    /// `train` must be the split the trainer was built with.
    pub fn fit(
        &mut self,
        train: &dyn BatchDataset,
        val: &dyn BatchDataset,
        test: &dyn BatchDataset,
        noisy_test: Option<&dyn BatchDataset>,
    ) -> anyhow::Result<TrainingReport> {
        if train.len() != self.train_len {
            anyhow::bail!(
                "trainer was built for a training split of {} samples but fit got {}",
                self.train_len,
                train.len()
            );
        }
        if val.is_empty() {
            anyhow::bail!("validation split is empty");
        }

        tracing::info!(
            train = train.len(),
            val = val.len(),
            test = test.len(),
            noisy_test = ?noisy_test.map(|d| d.len()),
            epochs = self.config.num_epochs,
            "Starting training"
        );

        let mut best_epoch = 0usize;
        let mut stopped_early = false;

        for epoch in 0..self.config.num_epochs {
            let epoch_no = epoch + 1;
            let started = Instant::now();

            let train_metrics = self.train_epoch(train, epoch)?;
            let val_metrics = self.validate(val)?;
            let next_lr = self.lr_scheduler.current_lr();

            self.history.train_losses.push(train_metrics.loss);
            self.history.val_losses.push(val_metrics.loss);
            self.history.train_accuracies.push(train_metrics.accuracy);
            self.history.val_accuracies.push(val_metrics.accuracy);
            self.history.val_f1s.push(val_metrics.f1);
            self.history.learning_rates.push(next_lr);

            tracing::info!(
                epoch = format!("{epoch_no}/{}", self.config.num_epochs),
                train_loss = format!("{:.4}", train_metrics.loss),
                train_acc = format!("{:.4}", train_metrics.accuracy),
                val_loss = format!("{:.4}", val_metrics.loss),
                val_acc = format!("{:.4}", val_metrics.accuracy),
                val_f1 = format!("{:.4}", val_metrics.f1),
                lr = format!("{next_lr:.6}"),
                secs = format!("{:.2}", started.elapsed().as_secs_f64()),
                "Epoch complete"
            );

            match self.early_stopping.observe(val_metrics.loss) {
                EpochVerdict::Improved => {
                    best_epoch = epoch_no;
                    let path = self.checkpoints.save_best(&self.varmap)?;
                    tracing::info!(
                        val_loss = format!("{:.4}", val_metrics.loss),
                        path = %path.display(),
                        "New best model"
                    );
                }
                EpochVerdict::NoImprovement {
                    epochs_without_improvement,
                } => {
                    tracing::info!(
                        patience = format!(
                            "{epochs_without_improvement}/{}",
                            self.early_stopping.patience()
                        ),
                        "Validation loss did not improve"
                    );
                }
                EpochVerdict::Stop => {
                    tracing::info!(epoch = epoch_no, "Early stopping triggered");
                    stopped_early = true;
                    break;
                }
            }

            if self.config.save_every_epoch {
                self.checkpoints.save_epoch(&self.varmap, epoch_no)?;
            }
            self.save_training_curves()?;
            self.analyze_modal_weights(epoch_no)?;
        }

        // ── Final evaluation ────────────────────────────────────────────────
        if self.checkpoints.load_best(&mut self.varmap)? {
            tracing::info!(path = %self.checkpoints.best_path().display(), "Loaded best model");
        } else {
            tracing::warn!("No best checkpoint was written; evaluating current weights");
        }

        let test_results = self.evaluate(test, "test")?;
        let noise_test_results = noisy_test
            .map(|ds| self.evaluate(ds, "noisy_test"))
            .transpose()?;

        log_results(&test_results);
        if let Some(r) = &noise_test_results {
            log_results(r);
        }

        let report = TrainingReport {
            history: self.history.clone(),
            best_val_loss: (best_epoch > 0).then(|| self.early_stopping.best_loss()),
            best_epoch,
            epochs_run: self.history.epochs(),
            stopped_early,
            alpha_values: self.alpha_values.clone(),
            test_results,
            noise_test_results,
        };
        let path = report.save(&self.config.result_dir)?;
        tracing::info!(path = %path.display(), "Results saved");
        Ok(report)
    }

    // ── Artifacts ───────────────────────────────────────────────────────────

    fn plots_dir(&self) -> PathBuf {
        self.config.result_dir.join("plots")
    }

    fn save_training_curves(&self) -> anyhow::Result<()> {
        let dir = self.plots_dir();
        let loss = plots::line_chart_svg(
            "Training and validation loss",
            "Epoch",
            "Loss",
            &[
                Series {
                    name: "train",
                    values: &self.history.train_losses,
                    color: COLOR_TRAIN,
                },
                Series {
                    name: "validation",
                    values: &self.history.val_losses,
                    color: COLOR_VAL,
                },
            ],
        );
        plots::write_svg(&dir.join("loss_curve.svg"), &loss)?;

        let acc = plots::line_chart_svg(
            "Training and validation accuracy",
            "Epoch",
            "Accuracy",
            &[
                Series {
                    name: "train",
                    values: &self.history.train_accuracies,
                    color: COLOR_TRAIN,
                },
                Series {
                    name: "validation",
                    values: &self.history.val_accuracies,
                    color: COLOR_VAL,
                },
            ],
        );
        plots::write_svg(&dir.join("accuracy_curve.svg"), &acc)
    }

    /// Histogram and summary of the text-branch gate seen so far.
    fn analyze_modal_weights(&mut self, epoch_no: usize) -> anyhow::Result<()> {
        if self.alpha_values.is_empty() {
            return Ok(());
        }
        let (mean, std) = mean_std(&self.alpha_values);
        self.history.alpha_history.push((mean, std));

        let svg = plots::histogram_svg(
            &format!("Text modality weight (epoch {epoch_no})"),
            "alpha",
            &self.alpha_values,
            HISTOGRAM_BINS,
        );
        plots::write_svg(
            &self
                .plots_dir()
                .join(format!("modal_weights_epoch_{epoch_no}.svg")),
            &svg,
        )?;
        tracing::info!(
            epoch = epoch_no,
            mean_alpha = format!("{mean:.4}"),
            std_alpha = format!("{std:.4}"),
            "Modality weights"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn class_weights(&self) -> Option<&Tensor> {
        self.class_weights.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_scheduler.current_lr()
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Evaluation ──────────────────────────────────────────────────────────────

/// Evaluate any model on a split in inference mode. An undefined AUC is
/// logged and reported as 0.
pub fn evaluate_model<M: MultimodalModel + ?Sized>(
    model: &M,
    dataset: &dyn BatchDataset,
    name: &str,
    num_classes: usize,
    batch_size: usize,
    device: &Device,
) -> anyhow::Result<EvalResults> {
    let mut predictions = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    let mut probabilities = Vec::with_capacity(dataset.len());

    let pb = progress_bar(dataset.num_batches(batch_size), &format!("eval {name}"))?;
    for batch in dataset.batches(batch_size, None) {
        let batch = to_device(&batch?, device)?;
        let out = model.forward(
            &batch.input_ids,
            &batch.attention_mask,
            &batch.images,
            false,
        )?;
        let probs = ops::softmax(&out.logits.to_dtype(DType::F32)?, D::Minus1)?;
        predictions.extend(out.logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
        labels.extend(batch.labels.to_vec1::<u32>()?);
        probabilities.extend(probs.to_vec2::<f32>()?);
        pb.inc(1);
    }
    pb.finish_and_clear();

    let auc = match roc_auc_ovr_macro(&labels, &probabilities, num_classes) {
        Ok(auc) => auc,
        Err(e) => {
            tracing::warn!(split = name, error = %e, "Could not compute AUC; reporting 0");
            0.0
        }
    };

    Ok(EvalResults {
        name: name.to_string(),
        accuracy: accuracy(&predictions, &labels),
        f1: macro_f1(&predictions, &labels),
        auc,
        predictions,
        labels,
        probabilities,
    })
}

fn log_results(results: &EvalResults) {
    tracing::info!(
        split = %results.name,
        samples = results.labels.len(),
        accuracy = format!("{:.4}", results.accuracy),
        f1 = format!("{:.4}", results.f1),
        auc = format!("{:.4}", results.auc),
        "Evaluation results"
    );
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn to_device(batch: &Batch, device: &Device) -> candle_core::Result<Batch> {
    Ok(Batch {
        input_ids: batch.input_ids.to_device(device)?,
        attention_mask: batch.attention_mask.to_device(device)?,
        images: batch.images.to_device(device)?,
        labels: batch.labels.to_device(device)?,
    })
}

fn count_correct(logits: &Tensor, labels: &Tensor) -> candle_core::Result<usize> {
    let preds = logits.argmax(D::Minus1)?;
    let hits = preds
        .eq(&labels.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as usize)
}

fn progress_bar(len: usize, prefix: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{prefix} [{bar:40}] {pos}/{len} {msg} ({eta})")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm || norm == 0.0 {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, Module};

    #[test]
    fn clipping_rescales_to_max_norm() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let w = varmap
            .get(2, "w", Init::Const(0.0), DType::F32, &dev)
            .unwrap();
        let x = Tensor::new(&[3f32, 4.], &dev).unwrap();
        // d/dw sum(w * x) = x, norm 5.
        let loss = w.mul(&x).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = varmap.all_vars();

        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 5.0).abs() < 1e-6);
        let after = grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-5);
        let g = grads.get(&w).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-6 && (g[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn clipping_leaves_small_gradients() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let w = varmap
            .get(2, "w", Init::Const(0.0), DType::F32, &dev)
            .unwrap();
        let x = Tensor::new(&[0.3f32, 0.4], &dev).unwrap();
        let loss = w.mul(&x).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let norm = clip_grad_norm(&mut grads, &varmap.all_vars(), 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        let g = grads.get(&w).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn correct_counts_argmax_hits() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 0., 0.], [0., 0., 1.], [0., 3., 0.]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1], &dev).unwrap();
        assert_eq!(count_correct(&logits, &labels).unwrap(), 2);
    }

    /// Linear head on mean image intensity; no contrastive objective.
    struct IntensityClassifier {
        linear: candle_nn::Linear,
    }

    impl MultimodalModel for IntensityClassifier {
        fn forward(
            &self,
            input_ids: &Tensor,
            _attention_mask: &Tensor,
            images: &Tensor,
            _train: bool,
        ) -> candle_core::Result<mmsa_core::ModelOutput> {
            let features = images.flatten_from(1)?.mean_keepdim(D::Minus1)?;
            let logits = self.linear.forward(&features)?;
            let text = input_ids.to_dtype(DType::F32)?.mean_keepdim(D::Minus1)?;
            Ok(mmsa_core::ModelOutput {
                logits,
                text_features: text,
                image_features: features,
                alpha: None,
            })
        }
    }

    #[test]
    fn evaluate_reports_zero_auc_for_single_class_split() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = IntensityClassifier {
            linear: candle_nn::linear(1, 3, vb.pp("head")).unwrap(),
        };
        let ds = mmsa_common::TensorDataset::new(
            Tensor::zeros((4, 2), DType::U32, &dev).unwrap(),
            Tensor::ones((4, 2), DType::U32, &dev).unwrap(),
            Tensor::zeros((4, 1, 2, 2), DType::F32, &dev).unwrap(),
            Tensor::new(&[1u32, 1, 1, 1], &dev).unwrap(),
        )
        .unwrap();

        let results = evaluate_model(&model, &ds, "single", 3, 3, &dev).unwrap();
        assert_eq!(results.auc, 0.0);
        assert_eq!(results.predictions.len(), 4);
        assert_eq!(results.probabilities.len(), 4);
        for row in &results.probabilities {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    // ── train_step loss composition ─────────────────────────────────────────

    fn tiny_split(labels: &[u32]) -> mmsa_common::TensorDataset {
        let dev = Device::Cpu;
        let n = labels.len();
        let ids: Vec<u32> = (0..n * 4).map(|i| (i % 20) as u32 + 1).collect();
        mmsa_common::TensorDataset::new(
            Tensor::from_vec(ids, (n, 4), &dev).unwrap(),
            Tensor::ones((n, 4), DType::U32, &dev).unwrap(),
            Tensor::rand(0f32, 1f32, (n, 3, 8, 8), &dev).unwrap(),
            Tensor::from_vec(labels.to_vec(), n, &dev).unwrap(),
        )
        .unwrap()
    }

    fn step_config(root: &std::path::Path, contrastive_weight: f64) -> TrainConfig {
        let mut config = TrainConfig {
            num_epochs: 1,
            batch_size: 4,
            contrastive_weight,
            device: "cpu".into(),
            model_save_path: root.join("checkpoints"),
            log_dir: root.join("logs"),
            result_dir: root.join("results"),
            ..Default::default()
        };
        config.augmentation.enabled = false;
        config
    }

    fn fusion_trainer(
        config: TrainConfig,
        train: &mmsa_common::TensorDataset,
    ) -> Trainer<mmsa_core::FusionClassifier> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model_config = mmsa_common::ModelConfig {
            vocab_size: 32,
            max_seq_len: 4,
            hidden_size: 16,
            projection_dim: 8,
            image_size: 8,
            ..Default::default()
        };
        let model = mmsa_core::FusionClassifier::new(vb, &model_config).unwrap();
        Trainer::new(model, varmap, config, train, dev).unwrap()
    }

    fn first_batch(ds: &mmsa_common::TensorDataset) -> Batch {
        ds.batches(4, None).next().unwrap().unwrap()
    }

    #[test]
    fn step_loss_adds_weighted_contrastive_term() {
        let dir = tempfile::tempdir().unwrap();
        let ds = tiny_split(&[0, 1, 2, 0]);
        let mut trainer = fusion_trainer(step_config(dir.path(), 0.5), &ds);

        let m = trainer.train_step(&first_batch(&ds)).unwrap();
        let contrastive = m.contrastive_loss.unwrap();
        assert!(contrastive.is_finite());
        assert!((m.loss - (m.classification_loss + 0.5 * contrastive)).abs() < 1e-5);
        assert_eq!(m.batch_size, 4);
        assert_eq!(m.alpha.len(), 4);
        assert_eq!(trainer.global_step(), 1);
    }

    #[test]
    fn zero_contrastive_weight_skips_the_term() {
        let dir = tempfile::tempdir().unwrap();
        let ds = tiny_split(&[0, 1, 2, 0]);
        let mut trainer = fusion_trainer(step_config(dir.path(), 0.0), &ds);

        let m = trainer.train_step(&first_batch(&ds)).unwrap();
        assert!(m.contrastive_loss.is_none());
        assert_eq!(m.loss, m.classification_loss);
    }

    #[test]
    fn model_without_contrastive_objective_trains_on_classification_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dev = Device::Cpu;
        let ds = tiny_split(&[0, 1, 2, 0]);
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = IntensityClassifier {
            linear: candle_nn::linear(1, 3, vb.pp("head")).unwrap(),
        };
        let mut trainer =
            Trainer::new(model, varmap, step_config(dir.path(), 0.5), &ds, dev).unwrap();

        let m = trainer.train_step(&first_batch(&ds)).unwrap();
        assert!(m.contrastive_loss.is_none());
        assert_eq!(m.loss, m.classification_loss);
        assert!(m.alpha.is_empty());
    }
}
