//! # mmsa-common — Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`TrainConfig`]** / **[`ModelConfig`]** — run and model knobs (serialised as JSON).
//! * **[`TensorDataset`]** / **[`BatchDataset`]** — labelled multimodal splits and batching.
//! * **[`Batch`]** — one mini-batch of token ids, masks, images and labels.

pub mod config;
pub mod data;

pub use config::{
    parse_device, AugmentationConfig, ClassWeightMethod, ModelConfig, OptimizerKind,
    SchedulerKind, TrainConfig,
};
pub use data::{Batch, BatchDataset, TensorDataset};
