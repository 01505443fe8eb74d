//! # mmsa-train
//!
//! Training loop, optimisers and scheduling for multimodal sentiment models:
//!
//! * **[`Trainer`]** — owns model + optimiser + schedules. [`Trainer::fit`]
//!   runs the epoch loop with validation, early stopping, checkpoints and
//!   plots, then evaluates the best weights on the test splits.
//! * **[`ParamOptimizer`]** — AdamW, Adam (coupled L2) or momentum SGD.
//! * **[`LrScheduler`]** — cosine / step / linear-with-warmup, per step.
//! * **[`Augmenter`]** — Mixup and CutMix on the image batch.

pub mod augment;
pub mod checkpoint;
pub mod class_weights;
pub mod early_stop;
pub mod metrics;
pub mod optim;
pub mod plots;
pub mod report;
pub mod scheduler;
pub mod trainer;

pub use augment::{Augmenter, MixKind, MixedBatch};
pub use checkpoint::{CheckpointManager, BEST_MODEL_FILE};
pub use class_weights::{class_weights, compute_class_weights, label_counts};
pub use early_stop::{EarlyStopping, EpochVerdict};
pub use metrics::EvalResults;
pub use optim::{MomentumSgd, ParamOptimizer, ParamsSgd};
pub use report::{TrainingHistory, TrainingReport, RESULTS_FILE};
pub use scheduler::{LrSchedule, LrScheduler};
pub use trainer::{evaluate_model, EpochMetrics, StepMetrics, Trainer, ValidationMetrics};
