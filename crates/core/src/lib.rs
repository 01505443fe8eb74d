//! # mmsa-core — Model Seam and Losses
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | `MultimodalModel` trait, `ModelOutput` |
//! | [`fusion`] | `FusionClassifier`, the gated reference model |
//! | [`loss`] | weighted / label-smoothed cross-entropy, mixed-target loss, InfoNCE |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs on
//! CPU and CUDA.

pub mod fusion;
pub mod loss;
pub mod model;

pub use fusion::FusionClassifier;
pub use loss::{
    info_nce_loss, mixed_cross_entropy, weighted_cross_entropy, weighted_cross_entropy_sums,
};
pub use model::{ModelOutput, MultimodalModel};
