//! Checkpoint files.
//!
//! ```text
//! <model_save_path>/
//!   best_model.safetensors       lowest validation loss so far
//!   model_epoch_{n}.safetensors  end of epoch n (1-based)
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_nn::VarMap;

pub const BEST_MODEL_FILE: &str = "best_model.safetensors";

/// Reads and writes model weights under one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_MODEL_FILE)
    }

    pub fn epoch_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model_epoch_{epoch}.safetensors"))
    }

    pub fn save_best(&self, varmap: &VarMap) -> anyhow::Result<PathBuf> {
        let path = self.best_path();
        varmap
            .save(&path)
            .with_context(|| format!("save {}", path.display()))?;
        Ok(path)
    }

    pub fn save_epoch(&self, varmap: &VarMap, epoch: usize) -> anyhow::Result<PathBuf> {
        let path = self.epoch_path(epoch);
        varmap
            .save(&path)
            .with_context(|| format!("save {}", path.display()))?;
        Ok(path)
    }

    /// Load the best weights into `varmap`. Returns `false` when no best
    /// checkpoint has been written.
    pub fn load_best(&self, varmap: &mut VarMap) -> anyhow::Result<bool> {
        let path = self.best_path();
        if !path.exists() {
            return Ok(false);
        }
        varmap
            .load(&path)
            .with_context(|| format!("load {}", path.display()))?;
        Ok(true)
    }
}
