//! Mean activation cache for mean ablation
//!
//! Stores, per component, the activation averaged over the batch dimension
//! of a reference dataset. Mean ablation substitutes this tensor for the
//! component's real output.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::ablation::{batches, AblationRunner};
use crate::error::{CircuitError, Result};
use crate::node::CircuitNode;

/// Per-component mean activations over a reference dataset
#[derive(Debug, Default)]
pub struct MeanCache {
    /// Mean activation per node, batch dimension removed
    means: HashMap<CircuitNode, Tensor>,
}

impl MeanCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `runner` over `dataset` and average every component's activation.
    ///
    /// `dataset` has the sample dimension first; it is processed in chunks
    /// of `batch_size` rows.
    pub fn compute<R: AblationRunner + ?Sized>(
        runner: &R,
        dataset: &Tensor,
        batch_size: usize,
    ) -> Result<Self> {
        let mut sums: HashMap<CircuitNode, Tensor> = HashMap::new();
        let mut n_samples = 0usize;

        for batch in batches(dataset, batch_size)? {
            n_samples += batch.dim(0)?;
            for (node, activation) in runner.activations(&batch)? {
                let batch_sum = activation.to_dtype(DType::F32)?.sum(0)?;
                let total = match sums.remove(&node) {
                    Some(total) => total.add(&batch_sum)?,
                    None => batch_sum,
                };
                sums.insert(node, total);
            }
        }

        if n_samples == 0 {
            return Err(CircuitError::InvalidConfig(
                "cannot compute a mean cache over an empty dataset".into(),
            ));
        }

        let scale = 1.0 / n_samples as f64;
        let means = sums
            .into_iter()
            .map(|(node, total)| Ok((node, total.affine(scale, 0.0)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        info!(
            "Computed mean cache: {} components over {} samples",
            means.len(),
            n_samples
        );
        Ok(Self { means })
    }

    /// Add or replace the mean activation for a node
    pub fn insert(&mut self, node: CircuitNode, mean: Tensor) {
        self.means.insert(node, mean);
    }

    /// Mean activation for a node
    pub fn get(&self, node: &CircuitNode) -> Option<&Tensor> {
        self.means.get(node)
    }

    /// Number of cached components
    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Write the cache as safetensors, keyed by the node display form
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .means
            .iter()
            .map(|(node, mean)| (node.to_string(), mean.clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load a cache written by [`MeanCache::save`]
    pub fn load(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)?;
        let means = tensors
            .into_iter()
            .map(|(key, mean)| Ok((key.parse::<CircuitNode>()?, mean)))
            .collect::<Result<HashMap<_, _>>>()?;
        Ok(Self { means })
    }
}
