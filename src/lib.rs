// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64 intentional for rates
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::module_name_repetitions)] // CircuitNode in node.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! circuit-bench: circuit representation and evaluation for
//! circuit-discovery benchmarks
//!
//! Represents candidate circuits of a transformer, derives ground-truth
//! circuits from high-level correspondences, and scores hypotheses both
//! structurally (node/edge FPR and TPR) and behaviorally (ablation).
//!
//! ## Architecture
//!
//! - `node`: CircuitNode identity (hook name + optional head index)
//! - `circuit`: Circuit graph with O(1) membership and edge cascade on removal
//! - `universe`: Model component universe and full circuit
//! - `correspondence`: High-level to low-level mapping and ground-truth expansion
//! - `comparison`: Confusion counts, FPR/TPR, score modes
//! - `ablation`: Zero/mean ablation harness over an `AblationRunner`
//! - `cache`: MeanCache of per-component mean activations
//! - `report`: Metrics sinks (tracing, memory, JSON lines)
//! - `experiment`: Run configuration, on-disk layout and experiment runner
//! - `error`: Crate error type

pub mod ablation;
pub mod cache;
pub mod circuit;
pub mod comparison;
pub mod correspondence;
pub mod error;
pub mod experiment;
pub mod node;
pub mod report;
pub mod universe;

pub use ablation::{
    nodes_to_ablate, sample_rows, score_outputs, Ablation, AblationHarness, AblationPolicy,
    AblationRunner, AblationScore, HarnessConfig, OutputMetric,
};
pub use cache::MeanCache;
pub use circuit::{Circuit, CircuitEdge};
pub use comparison::{
    check_within, evaluate_hypothesis_circuit, proportion_of_binary_scores, CircuitEvaluation,
    ConfusionCounts, Reference, ScoreMode, BINARY_SCORE_TOLERANCE,
};
pub use correspondence::{Correspondence, HighLevelNode, MappingPolicy, OverlapPolicy};
pub use error::{CircuitError, Result};
pub use experiment::{ComparisonReport, Experiment, ExperimentConfig};
pub use node::{CircuitNode, ComponentKind};
pub use report::{JsonLinesSink, MemorySink, Metrics, MetricsSink, TracingSink};
pub use universe::{all_edges, ComponentUniverse, ModelShape};
