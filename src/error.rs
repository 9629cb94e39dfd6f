//! Error type for circuit-bench
//!
//! Structural errors (bad mappings, unknown components) are raised at
//! construction or mutation time. Degenerate metrics are resolved locally
//! and never reach callers of the public scoring functions.

use thiserror::Error;

/// Errors produced by circuit construction, comparison and ablation.
#[derive(Debug, Error)]
pub enum CircuitError {
    /// A high-level node already has a mapping and overwriting was not requested.
    #[error("high-level node `{0}` already has a correspondence")]
    DuplicateMapping(String),

    /// Lookup against a high-level node that was never registered.
    #[error("unknown high-level node `{0}`")]
    UnknownHighLevelNode(String),

    /// A circuit references a node or edge outside the model's component universe.
    #[error("component `{0}` is not part of the model's component universe")]
    UnknownComponent(String),

    /// A low-level node is claimed by two high-level nodes while overlap is forbidden.
    #[error("low-level node `{node}` is claimed by both `{first}` and `{second}`")]
    AmbiguousMapping {
        node: String,
        first: String,
        second: String,
    },

    /// Zero denominator in a rate. Suppressed by the scoring code.
    #[error("degenerate metric: {0} has a zero denominator")]
    DegenerateMetric(&'static str),

    /// Mean ablation was requested for a node the mean cache has no entry for.
    #[error("mean cache has no activation for `{0}`")]
    MissingMeanActivation(String),

    /// Baseline and ablated outputs cannot be compared.
    #[error("output shape mismatch: baseline {baseline:?} vs ablated {ablated:?}")]
    ShapeMismatch {
        baseline: Vec<usize>,
        ablated: Vec<usize>,
    },

    /// A metric value JSON cannot represent (NaN or infinite).
    #[error("metric `{key}` is not finite ({value})")]
    NonFiniteMetric { key: String, value: f64 },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor operation failed.
    #[error(transparent)]
    Model(#[from] candle_core::Error),

    /// Failure reported by an external forward-pass runner.
    #[error(transparent)]
    Runner(anyhow::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CircuitError>;

impl CircuitError {
    /// Wrap an arbitrary runner failure so it propagates unchanged.
    pub fn runner(err: impl Into<anyhow::Error>) -> Self {
        Self::Runner(err.into())
    }
}
