//! Ablation evaluation harness
//!
//! Scores how well a circuit alone reproduces the model's behavior: every
//! component *outside* the circuit is ablated and the ablated outputs are
//! compared with the unmodified (baseline) outputs.
//!
//! ## Ablation Policies
//!
//! - **Zero**: the component's output is replaced by zeros
//! - **Mean**: the component's output is replaced by its mean activation
//!   over a reference dataset (see [`MeanCache`])
//!
//! ## Evaluation Steps
//!
//! 1. Validate the circuit against the runner's component universe. Unknown
//!    nodes fail before any forward pass is issued.
//! 2. Baseline pass on every batch.
//! 3. Ablated pass with the complement of the circuit ablated.
//! 4. Score the two outputs with an [`OutputMetric`].
//! 5. Optionally normalize against a reference circuit ([`ScoreMode`]).
//!
//! The forward pass itself belongs to an [`AblationRunner`]; the harness
//! only issues one `run` per batch and waits for its result.
//!
//! ## Example
//!
//! ```ignore
//! use circuit_bench::{AblationHarness, AblationPolicy, HarnessConfig};
//!
//! let config = HarnessConfig {
//!     policy: AblationPolicy::Mean,
//!     ..Default::default()
//! };
//! let mut harness = AblationHarness::new(&runner, config);
//! let score = harness.evaluate(&ground_truth, &dataset)?;
//! println!("Recovered {:.1}% of model behavior", score.value * 100.0);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::MeanCache;
use crate::circuit::Circuit;
use crate::comparison::{rate_or_zero, Reference, ScoreMode};
use crate::error::{CircuitError, Result};
use crate::node::CircuitNode;

/// Value substituted for an ablated component's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AblationPolicy {
    /// Force the output to zero
    #[default]
    Zero,
    /// Force the output to its mean over a reference dataset
    Mean,
}

impl fmt::Display for AblationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("zero"),
            Self::Mean => f.write_str("mean"),
        }
    }
}

/// Distance or agreement between baseline and ablated outputs
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMetric {
    /// Fraction of positions whose prediction is unchanged (categorical).
    /// Argmax over the last dimension; rank-1 outputs are compared as labels.
    #[default]
    Agreement,
    /// Fraction of output elements within `atol` of the baseline
    Closeness { atol: f32 },
    /// Mean per-position Euclidean distance over the last dimension
    L2,
    /// Mean per-position KL(baseline || ablated), softmax over the last dimension
    KlDivergence,
}

impl OutputMetric {
    /// True when higher values mean the outputs agree more
    pub fn is_similarity(&self) -> bool {
        matches!(self, Self::Agreement | Self::Closeness { .. })
    }

    /// Score of the baseline compared with itself
    pub fn identity_value(&self) -> f64 {
        if self.is_similarity() {
            1.0
        } else {
            0.0
        }
    }
}

/// A request to ablate a set of components under one policy
#[derive(Debug, Clone)]
pub struct Ablation<'a> {
    nodes: HashSet<CircuitNode>,
    policy: AblationPolicy,
    mean_cache: Option<&'a MeanCache>,
}

impl Ablation<'static> {
    /// Ablate nothing
    pub fn none() -> Self {
        Self {
            nodes: HashSet::new(),
            policy: AblationPolicy::Zero,
            mean_cache: None,
        }
    }

    /// Zero-ablate the given nodes
    pub fn zero(nodes: HashSet<CircuitNode>) -> Self {
        Self {
            nodes,
            policy: AblationPolicy::Zero,
            mean_cache: None,
        }
    }
}

impl<'a> Ablation<'a> {
    /// Create an ablation request
    pub fn new(
        nodes: HashSet<CircuitNode>,
        policy: AblationPolicy,
        mean_cache: Option<&'a MeanCache>,
    ) -> Self {
        Self {
            nodes,
            policy,
            mean_cache,
        }
    }

    /// Mean-ablate the given nodes
    pub fn mean(nodes: HashSet<CircuitNode>, cache: &'a MeanCache) -> Self {
        Self::new(nodes, AblationPolicy::Mean, Some(cache))
    }

    pub fn nodes(&self) -> &HashSet<CircuitNode> {
        &self.nodes
    }

    pub fn policy(&self) -> AblationPolicy {
        self.policy
    }

    /// Check if a node is ablated by this request
    pub fn is_ablated(&self, node: &CircuitNode) -> bool {
        self.nodes.contains(node)
    }

    /// Check if nothing is ablated
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replacement for `activation` if `node` is ablated, `None` otherwise.
    ///
    /// Mean activations are broadcast over the batch dimension and cast to
    /// the activation's dtype.
    pub fn replacement(&self, node: &CircuitNode, activation: &Tensor) -> Result<Option<Tensor>> {
        if !self.is_ablated(node) {
            return Ok(None);
        }
        let replaced = match self.policy {
            AblationPolicy::Zero => activation.zeros_like()?,
            AblationPolicy::Mean => {
                let mean = self
                    .mean_cache
                    .and_then(|cache| cache.get(node))
                    .ok_or_else(|| CircuitError::MissingMeanActivation(node.to_string()))?;
                mean.to_dtype(activation.dtype())?
                    .broadcast_as(activation.dims())?
                    .contiguous()?
            }
        };
        Ok(Some(replaced))
    }

    /// `activation`, or its replacement if `node` is ablated
    pub fn apply(&self, node: &CircuitNode, activation: Tensor) -> Result<Tensor> {
        Ok(self.replacement(node, &activation)?.unwrap_or(activation))
    }
}

/// Forward-pass collaborator used by the harness
///
/// Implementations own the model, its device and any batching beyond what
/// the harness chooses. Errors propagate unchanged to the harness caller.
pub trait AblationRunner {
    /// Every addressable component of the model
    fn components(&self) -> Vec<CircuitNode>;

    /// Per-component activations on `batch` (sample dimension first)
    fn activations(&self, batch: &Tensor) -> Result<HashMap<CircuitNode, Tensor>>;

    /// Model output on `batch` with `ablation` applied
    fn run(&self, batch: &Tensor, ablation: &Ablation<'_>) -> Result<Tensor>;
}

/// Split `dataset` into chunks of at most `batch_size` rows
pub(crate) fn batches(dataset: &Tensor, batch_size: usize) -> Result<Vec<Tensor>> {
    if batch_size == 0 {
        return Err(CircuitError::InvalidConfig("batch_size must be positive".into()));
    }
    let n = dataset.dim(0)?;
    let mut chunks = Vec::with_capacity(n.div_ceil(batch_size));
    let mut start = 0;
    while start < n {
        let len = batch_size.min(n - start);
        chunks.push(dataset.narrow(0, start, len)?);
        start += len;
    }
    Ok(chunks)
}

/// Deterministically subsample at most `max_samples` rows of `dataset`
pub fn sample_rows(dataset: &Tensor, max_samples: usize, seed: u64) -> Result<Tensor> {
    let n = dataset.dim(0)?;
    if n <= max_samples {
        return Ok(dataset.clone());
    }
    let indices = sample_indices(n, max_samples, seed)?;
    let ids = Tensor::from_vec(indices, max_samples, dataset.device())?;
    Ok(dataset.index_select(&ids, 0)?)
}

/// First `max_samples` of a seeded shuffle of `0..n`
fn sample_indices(n: usize, max_samples: usize, seed: u64) -> Result<Vec<u32>> {
    let rows = u32::try_from(n).map_err(|_| {
        CircuitError::InvalidConfig(format!(
            "cannot subsample {n} rows, at most {} are supported",
            u32::MAX
        ))
    })?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<u32> = (0..rows).collect();
    indices.shuffle(&mut rng);
    indices.truncate(max_samples);
    Ok(indices)
}

/// Components of `universe` not in `circuit`.
///
/// Fails with `UnknownComponent` if the circuit references a node outside
/// the universe.
pub fn nodes_to_ablate(
    universe: &[CircuitNode],
    circuit: &Circuit,
) -> Result<HashSet<CircuitNode>> {
    let mut ablate: HashSet<CircuitNode> = universe.iter().cloned().collect();
    for node in circuit.sorted_nodes() {
        if !ablate.remove(node) {
            return Err(CircuitError::UnknownComponent(node.to_string()));
        }
        debug!("Not ablating node: {node}");
    }
    Ok(ablate)
}

/// `[positions, classes]` f32 view of a model output.
///
/// The last dimension holds classes; every leading dimension indexes
/// positions, so `[batch, seq, vocab]` logits become `[batch * seq, vocab]`.
/// Rank-1 outputs are one prediction per sample (`[n, 1]`).
fn to_positions(output: &Tensor) -> Result<Tensor> {
    let output = output.to_dtype(DType::F32)?;
    let output = match output.rank() {
        0 => output.reshape((1, 1))?,
        1 => output.unsqueeze(1)?,
        rank => output.flatten_to(rank - 2)?,
    };
    Ok(output.contiguous()?)
}

fn argmax(row: &[f32]) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val {
                (i, v)
            } else {
                (best, best_val)
            }
        })
        .0
}

/// Mean of `metric` over the positions of one batch
pub fn score_outputs(metric: OutputMetric, baseline: &Tensor, ablated: &Tensor) -> Result<f64> {
    if baseline.dims() != ablated.dims() {
        return Err(CircuitError::ShapeMismatch {
            baseline: baseline.dims().to_vec(),
            ablated: ablated.dims().to_vec(),
        });
    }

    let (base, abl) = (to_positions(baseline)?, to_positions(ablated)?);
    if base.dim(0)? == 0 {
        return Ok(metric.identity_value());
    }
    let (base, abl) = match metric {
        OutputMetric::KlDivergence => (
            candle_nn::ops::softmax_last_dim(&base)?,
            candle_nn::ops::softmax_last_dim(&abl)?,
        ),
        _ => (base, abl),
    };
    let base_rows = base.to_vec2::<f32>()?;
    let abl_rows = abl.to_vec2::<f32>()?;

    let per_position = base_rows.iter().zip(&abl_rows).map(|(b, a)| match metric {
        // a single class is a prediction itself
        OutputMetric::Agreement if b.len() == 1 => f64::from(u8::from(b[0] == a[0])),
        OutputMetric::Agreement => f64::from(u8::from(argmax(b) == argmax(a))),
        OutputMetric::Closeness { atol } => {
            let close = b
                .iter()
                .zip(a)
                .filter(|&(&bv, &av)| (av - bv).abs() <= atol + 1e-5 * bv.abs())
                .count();
            close as f64 / b.len().max(1) as f64
        }
        OutputMetric::L2 => b
            .iter()
            .zip(a)
            .map(|(&bv, &av)| f64::from(bv - av).powi(2))
            .sum::<f64>()
            .sqrt(),
        OutputMetric::KlDivergence => b
            .iter()
            .zip(a)
            .filter(|&(&p, &q)| p > 1e-10 && q > 1e-10)
            .map(|(&p, &q)| f64::from(p) * (f64::from(p) / f64::from(q)).ln())
            .sum(),
    });
    Ok(per_position.sum::<f64>() / base_rows.len() as f64)
}

/// Configuration for one harness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Ablation policy for components outside the circuit
    pub policy: AblationPolicy,
    /// Output comparison metric
    pub metric: OutputMetric,
    /// Absolute or relative reporting
    pub mode: ScoreMode,
    /// Rows per `run` call
    pub batch_size: usize,
    /// Subsample the evaluation dataset to at most this many rows
    pub max_samples: Option<usize>,
    /// Seed for subsampling
    pub seed: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            policy: AblationPolicy::Zero,
            metric: OutputMetric::Agreement,
            mode: ScoreMode::default(),
            batch_size: 512,
            max_samples: Some(1000),
            seed: 42,
        }
    }
}

/// Result of scoring one circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AblationScore {
    /// Reported score (normalized in relative mode)
    pub value: f64,
    /// Metric value before normalization
    pub raw: f64,
    /// Value the score is relative to: the reference circuit's raw score in
    /// relative mode, the baseline's self-score in absolute mode
    pub baseline: f64,
    pub policy: AblationPolicy,
    pub metric: OutputMetric,
    pub mode: ScoreMode,
    /// Samples evaluated
    pub n_samples: usize,
    /// Components ablated
    pub n_ablated: usize,
}

/// Runs baseline and ablated passes and scores circuits
pub struct AblationHarness<'r, R: AblationRunner + ?Sized> {
    runner: &'r R,
    config: HarnessConfig,
    mean_cache: Option<MeanCache>,
}

impl<'r, R: AblationRunner + ?Sized> AblationHarness<'r, R> {
    /// Create a harness around a runner
    pub fn new(runner: &'r R, config: HarnessConfig) -> Self {
        Self {
            runner,
            config,
            mean_cache: None,
        }
    }

    /// Use a precomputed mean cache instead of computing one on demand
    pub fn with_mean_cache(mut self, cache: MeanCache) -> Self {
        self.mean_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The mean cache, if one was supplied or computed
    pub fn mean_cache(&self) -> Option<&MeanCache> {
        self.mean_cache.as_ref()
    }

    /// Score `circuit` on `dataset`.
    ///
    /// Ablates every component outside the circuit and compares the result
    /// with the unmodified model.
    pub fn evaluate(&mut self, circuit: &Circuit, dataset: &Tensor) -> Result<AblationScore> {
        let universe = self.runner.components();
        let ablate = nodes_to_ablate(&universe, circuit)?;
        let dataset = self.prepare(dataset)?;

        let baselines = self.baseline_outputs(&dataset)?;
        let raw = self.score_ablating(&ablate, &dataset, &baselines)?;

        let (value, baseline) = match self.config.mode {
            ScoreMode::Absolute => (raw, self.config.metric.identity_value()),
            ScoreMode::Relative(reference) => {
                let reference_nodes = match reference {
                    Reference::FullCircuit => HashSet::new(),
                    Reference::EmptyCircuit => universe.iter().cloned().collect(),
                };
                let reference_raw = self.score_ablating(&reference_nodes, &dataset, &baselines)?;
                (rate_or_zero(raw, reference_raw, "relative score"), reference_raw)
            }
        };

        let n_samples = dataset.dim(0)?;
        info!(
            "Circuit score ({} ablation, {:?}): {:.4} (raw {:.4}, {} of {} components ablated, {} samples)",
            self.config.policy,
            self.config.metric,
            value,
            raw,
            ablate.len(),
            universe.len(),
            n_samples
        );

        Ok(AblationScore {
            value,
            raw,
            baseline,
            policy: self.config.policy,
            metric: self.config.metric,
            mode: self.config.mode,
            n_samples,
            n_ablated: ablate.len(),
        })
    }

    /// Model outputs on `dataset` with the complement of `circuit` ablated,
    /// concatenated over batches
    pub fn ablated_outputs(&mut self, circuit: &Circuit, dataset: &Tensor) -> Result<Tensor> {
        let ablate = nodes_to_ablate(&self.runner.components(), circuit)?;
        let dataset = self.prepare(dataset)?;
        let ablation = Ablation::new(ablate, self.config.policy, self.mean_cache.as_ref());
        let outputs = batches(&dataset, self.config.batch_size)?
            .iter()
            .map(|batch| self.runner.run(batch, &ablation))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 0)?)
    }

    /// Subsample and make sure a mean cache exists when needed
    fn prepare(&mut self, dataset: &Tensor) -> Result<Tensor> {
        let dataset = match self.config.max_samples {
            Some(max) => sample_rows(dataset, max, self.config.seed)?,
            None => dataset.clone(),
        };
        if self.config.policy == AblationPolicy::Mean && self.mean_cache.is_none() {
            info!("No mean cache supplied, computing one from the evaluation data");
            self.mean_cache = Some(MeanCache::compute(
                self.runner,
                &dataset,
                self.config.batch_size,
            )?);
        }
        Ok(dataset)
    }

    fn baseline_outputs(&self, dataset: &Tensor) -> Result<Vec<(Tensor, Tensor)>> {
        let none = Ablation::none();
        batches(dataset, self.config.batch_size)?
            .into_iter()
            .map(|batch| {
                let output = self.runner.run(&batch, &none)?;
                Ok((batch, output))
            })
            .collect()
    }

    /// Sample-weighted mean metric with `nodes` ablated
    fn score_ablating(
        &self,
        nodes: &HashSet<CircuitNode>,
        dataset: &Tensor,
        baselines: &[(Tensor, Tensor)],
    ) -> Result<f64> {
        let ablation = Ablation::new(nodes.clone(), self.config.policy, self.mean_cache.as_ref());
        let n_samples = dataset.dim(0)?;
        if n_samples == 0 {
            return Ok(self.config.metric.identity_value());
        }

        let mut total = 0.0;
        for (batch, baseline) in baselines {
            let ablated = self.runner.run(batch, &ablation)?;
            let score = score_outputs(self.config.metric, baseline, &ablated)?;
            total += score * batch.dim(0)? as f64;
        }
        Ok(total / n_samples as f64)
    }
}
