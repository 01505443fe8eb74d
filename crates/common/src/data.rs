//! Data splits and batching.
//!
//! Tokenisation and image decoding happen upstream. A split arrives as one
//! safetensors file holding four tensors:
//!
//! | Key | Shape | DType |
//! |-----|-------|-------|
//! | `input_ids` | `(N, L)` | u32 |
//! | `attention_mask` | `(N, L)` | u32 (1 = real token) |
//! | `images` | `(N, C, H, W)` | f32 |
//! | `labels` | `(N,)` | u32 |
//!
//! * **[`TensorDataset`]** — the whole split resident on one device.
//! * **[`BatchDataset`]** — what the trainer iterates over.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{DType, Device, Result, Tensor};

const KEY_INPUT_IDS: &str = "input_ids";
const KEY_ATTENTION_MASK: &str = "attention_mask";
const KEY_IMAGES: &str = "images";
const KEY_LABELS: &str = "labels";

// ── Batch ───────────────────────────────────────────────────────────────────

/// One mini-batch, already on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for labelled multimodal splits.
pub trait BatchDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches per pass; the last one may be short.
    fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }

    /// Every label of the split, in storage order.
    fn labels(&self) -> Result<Vec<u32>>;

    /// Iterate over batches. With `order = Some(perm)` samples are visited in
    /// permutation order; `perm` must index into `0..len()`.
    fn batches<'a>(
        &'a self,
        batch_size: usize,
        order: Option<&'a [u32]>,
    ) -> Box<dyn Iterator<Item = Result<Batch>> + 'a>;
}

// ── TensorDataset ───────────────────────────────────────────────────────────

/// In-memory split backed by four tensors sharing a leading dimension.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    input_ids: Tensor,
    attention_mask: Tensor,
    images: Tensor,
    labels: Tensor,
    len: usize,
}

impl TensorDataset {
    /// Build from tensors, checking shapes and normalising dtypes.
    pub fn new(
        input_ids: Tensor,
        attention_mask: Tensor,
        images: Tensor,
        labels: Tensor,
    ) -> AnyhowResult<Self> {
        let len = labels.dims1().context("labels must be 1-D")?;
        let (n_text, seq_len) = input_ids.dims2().context("input_ids must be 2-D")?;
        if attention_mask.dims() != input_ids.dims() {
            anyhow::bail!(
                "attention_mask shape {:?} does not match input_ids shape {:?}",
                attention_mask.dims(),
                input_ids.dims()
            );
        }
        let (n_img, _, _, _) = images.dims4().context("images must be (N, C, H, W)")?;
        if n_text != len || n_img != len {
            anyhow::bail!(
                "split sizes disagree: {n_text} texts, {n_img} images, {len} labels"
            );
        }
        if seq_len == 0 && len > 0 {
            anyhow::bail!("input_ids has zero sequence length");
        }
        Ok(Self {
            input_ids: input_ids.to_dtype(DType::U32)?,
            attention_mask: attention_mask.to_dtype(DType::U32)?,
            images: images.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
            len,
        })
    }

    /// Load a split from a safetensors file onto `device`.
    pub fn load(path: &Path, device: &Device) -> AnyhowResult<Self> {
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("load split {}", path.display()))?;
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .with_context(|| format!("{} is missing tensor {key:?}", path.display()))
        };
        let input_ids = take(KEY_INPUT_IDS)?;
        let attention_mask = take(KEY_ATTENTION_MASK)?;
        let images = take(KEY_IMAGES)?;
        let labels = take(KEY_LABELS)?;
        Self::new(input_ids, attention_mask, images, labels)
    }

    /// Write the split in the format [`load`](Self::load) reads.
    pub fn save(&self, path: &Path) -> AnyhowResult<()> {
        let mut tensors = HashMap::new();
        tensors.insert(KEY_INPUT_IDS, self.input_ids.clone());
        tensors.insert(KEY_ATTENTION_MASK, self.attention_mask.clone());
        tensors.insert(KEY_IMAGES, self.images.clone());
        tensors.insert(KEY_LABELS, self.labels.clone());
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("save split {}", path.display()))?;
        Ok(())
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }

    /// `(C, H, W)` of every image.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        let d = self.images.dims();
        (d[1], d[2], d[3])
    }

    pub fn device(&self) -> &Device {
        self.labels.device()
    }

    /// Contiguous slice `[start, start + len)`.
    fn slice(&self, start: usize, len: usize) -> Result<Batch> {
        Ok(Batch {
            input_ids: self.input_ids.narrow(0, start, len)?,
            attention_mask: self.attention_mask.narrow(0, start, len)?,
            images: self.images.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
        })
    }

    /// Gather arbitrary rows.
    fn gather(&self, indices: &[u32]) -> Result<Batch> {
        let idx = Tensor::from_slice(indices, indices.len(), self.device())?;
        Ok(Batch {
            input_ids: self.input_ids.index_select(&idx, 0)?,
            attention_mask: self.attention_mask.index_select(&idx, 0)?,
            images: self.images.index_select(&idx, 0)?,
            labels: self.labels.index_select(&idx, 0)?,
        })
    }
}

impl BatchDataset for TensorDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn labels(&self) -> Result<Vec<u32>> {
        self.labels.to_vec1::<u32>()
    }

    fn batches<'a>(
        &'a self,
        batch_size: usize,
        order: Option<&'a [u32]>,
    ) -> Box<dyn Iterator<Item = Result<Batch>> + 'a> {
        if batch_size == 0 {
            return Box::new(std::iter::empty());
        }
        match order {
            Some(perm) => Box::new(perm.chunks(batch_size).map(|chunk| self.gather(chunk))),
            None => {
                let len = self.len;
                Box::new((0..len).step_by(batch_size).map(move |start| {
                    self.slice(start, batch_size.min(len - start))
                }))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize) -> TensorDataset {
        let dev = Device::Cpu;
        let ids: Vec<u32> = (0..(n * 4) as u32).collect();
        let input_ids = Tensor::from_vec(ids, (n, 4), &dev).unwrap();
        let mask = Tensor::ones((n, 4), DType::U32, &dev).unwrap();
        let images = Tensor::zeros((n, 3, 8, 8), DType::F32, &dev).unwrap();
        let labels: Vec<u32> = (0..n as u32).map(|i| i % 3).collect();
        let labels = Tensor::from_vec(labels, n, &dev).unwrap();
        TensorDataset::new(input_ids, mask, images, labels).unwrap()
    }

    #[test]
    fn sequential_batches_cover_split_with_short_tail() {
        let ds = toy(10);
        assert_eq!(ds.num_batches(4), 3);
        let sizes: Vec<usize> = ds
            .batches(4, None)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn permuted_batches_follow_order() {
        let ds = toy(5);
        let perm = [4u32, 3, 2, 1, 0];
        let first = ds.batches(2, Some(&perm)).next().unwrap().unwrap();
        assert_eq!(first.labels.to_vec1::<u32>().unwrap(), vec![1, 0]);
        let ids = first.input_ids.to_vec2::<u32>().unwrap();
        assert_eq!(ids[0], vec![16, 17, 18, 19]);
    }

    #[test]
    fn empty_split_yields_nothing() {
        let ds = toy(0);
        assert!(ds.is_empty());
        assert_eq!(ds.batches(8, None).count(), 0);
    }

    #[test]
    fn mismatched_sizes_rejected() {
        let dev = Device::Cpu;
        let input_ids = Tensor::zeros((3, 4), DType::U32, &dev).unwrap();
        let mask = Tensor::zeros((3, 4), DType::U32, &dev).unwrap();
        let images = Tensor::zeros((2, 3, 8, 8), DType::F32, &dev).unwrap();
        let labels = Tensor::zeros(3, DType::U32, &dev).unwrap();
        assert!(TensorDataset::new(input_ids, mask, images, labels).is_err());
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.safetensors");
        let ds = toy(6);
        ds.save(&path).unwrap();
        let loaded = TensorDataset::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.image_dims(), (3, 8, 8));
        assert_eq!(loaded.labels().unwrap(), ds.labels().unwrap());
    }
}
