//! Experiment runner for circuit-discovery benchmarks
//!
//! Coordinates comparison against the ground truth, ablation scoring,
//! metrics reporting and the on-disk run layout:
//!
//! ```text
//! {output_dir}/{node_|edge_}sp_{case}/{suffix}/lambda_{reg}/circuit.json
//! {output_dir}/{node_|edge_}sp_{case}/{suffix}/lambda_{reg}/result.json
//! {output_dir}/gt_scores_{zero|mean}/{case}_{suffix}.txt
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ablation::{
    AblationHarness, AblationPolicy, AblationRunner, AblationScore, HarnessConfig, OutputMetric,
};
use crate::cache::MeanCache;
use crate::circuit::Circuit;
use crate::comparison::{
    evaluate_hypothesis_circuit, proportion_of_binary_scores, CircuitEvaluation, ScoreMode,
};
use crate::error::{CircuitError, Result};
use crate::report::{Metrics, MetricsSink};

/// Configuration for a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Benchmark case identifier
    pub case_id: String,
    /// Hyperparameter suffix distinguishing runs of the same case
    pub output_suffix: String,
    /// Root directory for run outputs
    pub output_dir: PathBuf,
    /// Ablation policy for behavioral scoring
    pub policy: AblationPolicy,
    /// Output comparison metric
    pub metric: OutputMetric,
    /// Absolute or relative behavioral scores
    pub mode: ScoreMode,
    /// Rows per forward pass
    pub batch_size: usize,
    /// Evaluation subsample size (None = whole dataset)
    pub max_samples: Option<usize>,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Regularization strength of the discovery run
    pub lambda_reg: f64,
    /// Edge-level (true) or node-level (false) discovery
    pub edgewise: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            case_id: "3".to_string(),
            output_suffix: "default".to_string(),
            output_dir: PathBuf::from("results"),
            policy: AblationPolicy::Zero,
            metric: OutputMetric::Agreement,
            mode: ScoreMode::default(),
            batch_size: 512,
            max_samples: Some(1000),
            seed: 42,
            lambda_reg: 1.0,
            edgewise: false,
        }
    }
}

impl ExperimentConfig {
    /// Load a config from JSON; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values no run can use
    pub fn validate(&self) -> Result<()> {
        if self.case_id.is_empty() {
            return Err(CircuitError::InvalidConfig("case_id must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(CircuitError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_samples == Some(0) {
            return Err(CircuitError::InvalidConfig("max_samples must be positive".into()));
        }
        Ok(())
    }

    /// Harness settings carried by this config
    pub fn harness_config(&self) -> HarnessConfig {
        HarnessConfig {
            policy: self.policy,
            metric: self.metric,
            mode: self.mode,
            batch_size: self.batch_size,
            max_samples: self.max_samples,
            seed: self.seed,
        }
    }

    /// Directory of this run's circuit and result files
    pub fn run_dir(&self) -> PathBuf {
        let kind = if self.edgewise { "edge" } else { "node" };
        self.output_dir
            .join(format!("{kind}_sp_{}", self.case_id))
            .join(&self.output_suffix)
            .join(format!("lambda_{}", self.lambda_reg))
    }

    pub fn circuit_path(&self) -> PathBuf {
        self.run_dir().join("circuit.json")
    }

    pub fn result_path(&self) -> PathBuf {
        self.run_dir().join("result.json")
    }

    /// Ground-truth ablation score file for this case and policy
    pub fn score_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("gt_scores_{}", self.policy))
            .join(format!("{}_{}.txt", self.case_id, self.output_suffix))
    }
}

/// Persisted outcome of comparing one hypothesis with the ground truth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub case_id: String,
    pub output_suffix: String,
    pub lambda_reg: f64,
    pub evaluation: CircuitEvaluation,
    pub metrics: Metrics,
}

/// Main experiment runner
pub struct Experiment<S: MetricsSink> {
    config: ExperimentConfig,
    sink: S,
}

impl<S: MetricsSink> Experiment<S> {
    /// Create a new experiment
    pub fn new(config: ExperimentConfig, sink: S) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Compare `hypothesis` with `ground_truth` over `full`, log the rates
    /// and persist the circuit and result under the run directory.
    ///
    /// `mask_scores` are the discovery run's raw mask values; when given,
    /// their binary proportion is logged as `percentage_binary`.
    pub fn compare(
        &mut self,
        hypothesis: &Circuit,
        ground_truth: &Circuit,
        full: &Circuit,
        mask_scores: Option<&[f64]>,
    ) -> Result<ComparisonReport> {
        info!(
            "Comparing hypothesis ({} nodes, {} edges) with ground truth ({} nodes, {} edges)",
            hypothesis.len(),
            hypothesis.edge_count(),
            ground_truth.len(),
            ground_truth.edge_count()
        );
        let evaluation = evaluate_hypothesis_circuit(hypothesis, ground_truth, full)?;

        let mut metrics = evaluation.to_metrics();
        metrics.insert("regularizer".to_string(), self.config.lambda_reg);
        if let Some(scores) = mask_scores {
            metrics.insert(
                "percentage_binary".to_string(),
                proportion_of_binary_scores(scores),
            );
        }
        self.sink.log(&metrics)?;

        let run_dir = self.config.run_dir();
        fs::create_dir_all(&run_dir)?;
        hypothesis.save(self.config.circuit_path())?;

        let report = ComparisonReport {
            case_id: self.config.case_id.clone(),
            output_suffix: self.config.output_suffix.clone(),
            lambda_reg: self.config.lambda_reg,
            evaluation,
            metrics,
        };
        fs::write(
            self.config.result_path(),
            serde_json::to_string_pretty(&report)?,
        )?;
        info!("Saved results to {}", run_dir.display());

        Ok(report)
    }

    /// Score `circuit` by ablation and write the score file.
    ///
    /// `mean_cache` is only consulted under mean ablation; without one the
    /// harness computes it from `dataset`.
    pub fn score_circuit<R: AblationRunner + ?Sized>(
        &mut self,
        runner: &R,
        circuit: &Circuit,
        dataset: &Tensor,
        mean_cache: Option<MeanCache>,
    ) -> Result<AblationScore> {
        let mut harness = AblationHarness::new(runner, self.config.harness_config());
        if let Some(cache) = mean_cache {
            harness = harness.with_mean_cache(cache);
        }
        let score = harness.evaluate(circuit, dataset)?;

        let metrics = Metrics::from([
            ("score".to_string(), score.value),
            ("score_raw".to_string(), score.raw),
        ]);
        self.sink.log(&metrics)?;

        let path = self.config.score_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", score.value))?;
        info!(
            "Circuit score ({} ablation): {:.4}, written to {}",
            self.config.policy,
            score.value,
            path.display()
        );

        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CircuitNode;
    use crate::report::MemorySink;
    use crate::universe::{ComponentUniverse, ModelShape};

    #[test]
    fn test_default_config() {
        let config = ExperimentConfig::default();
        assert_eq!(config.batch_size, 512);
        assert_eq!(config.max_samples, Some(1000));
        assert_eq!(config.seed, 42);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_run_layout() {
        let config = ExperimentConfig {
            case_id: "7".into(),
            output_suffix: "lr_0.01".into(),
            output_dir: PathBuf::from("out"),
            policy: AblationPolicy::Mean,
            lambda_reg: 0.5,
            edgewise: true,
            ..Default::default()
        };
        assert_eq!(
            config.circuit_path(),
            PathBuf::from("out/edge_sp_7/lr_0.01/lambda_0.5/circuit.json")
        );
        assert_eq!(
            config.score_path(),
            PathBuf::from("out/gt_scores_mean/7_lr_0.01.txt")
        );

        let node_config = ExperimentConfig {
            edgewise: false,
            ..config
        };
        assert!(node_config.run_dir().starts_with("out/node_sp_7"));
    }

    #[test]
    fn test_config_json_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"case_id": "12", "policy": "mean", "batch_size": 64}"#).unwrap();

        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.case_id, "12");
        assert_eq!(config.policy, AblationPolicy::Mean);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.seed, 42);

        fs::write(&path, r#"{"batch_size": 0}"#).unwrap();
        assert!(matches!(
            ExperimentConfig::load(&path),
            Err(CircuitError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_compare_logs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig {
            output_dir: dir.path().to_path_buf(),
            lambda_reg: 2.0,
            ..Default::default()
        };
        let shape = ModelShape::new(2, 2);
        let full = shape.full_circuit();

        let mut gt = Circuit::new();
        gt.add_edge(CircuitNode::attention_head(0, 0), CircuitNode::mlp(0));
        let mut hyp = gt.clone();
        hyp.add_node(CircuitNode::mlp(1));

        let mut experiment = Experiment::new(config.clone(), MemorySink::new());
        let report = experiment
            .compare(&hyp, &gt, &full, Some(&[0.0, 1.0, 0.5, 0.999]))
            .unwrap();

        assert_eq!(report.evaluation.nodes.tpr(), 1.0);
        assert_eq!(experiment.sink().last("regularizer"), Some(2.0));
        assert_eq!(experiment.sink().last("edges_tpr"), Some(1.0));
        assert!(experiment.sink().last("nodes_fpr").unwrap() > 0.0);
        assert_eq!(experiment.sink().last("percentage_binary"), Some(0.75));
        assert_eq!(report.metrics["percentage_binary"], 0.75);

        assert_eq!(Circuit::load(config.circuit_path()).unwrap(), hyp);
        let saved: ComparisonReport =
            serde_json::from_str(&fs::read_to_string(config.result_path()).unwrap()).unwrap();
        assert_eq!(saved.evaluation, report.evaluation);
    }

    #[test]
    fn test_compare_failure_names_node() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExperimentConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let full = ModelShape::new(1, 1).full_circuit();
        let mut hyp = Circuit::new();
        hyp.add_node(CircuitNode::mlp(4));

        let mut experiment = Experiment::new(config.clone(), MemorySink::new());
        let err = experiment
            .compare(&hyp, &Circuit::new(), &full, None)
            .unwrap_err();
        assert!(err.to_string().contains("blocks.4.hook_mlp_out"));
        assert!(experiment.sink().records.is_empty());
        assert!(!config.result_path().exists());
    }
}
