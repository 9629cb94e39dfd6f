//! Circuit comparison: confusion counts and FPR/TPR
//!
//! Compares a hypothesis circuit against a ground-truth circuit over a
//! shared universe of components (the full circuit). Node sets and edge sets
//! are scored independently.
//!
//! Rates with a zero denominator are defined as `0.0`. Trivial programs can
//! produce degenerate universes, so this is a normal outcome, not an error.

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit::Circuit;
use crate::error::{CircuitError, Result};

/// Which circuit a relative score is normalized against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reference {
    /// Full circuit: nothing is ablated
    #[default]
    FullCircuit,
    /// Empty circuit: every component is ablated
    EmptyCircuit,
}

/// Absolute vs relative reporting of behavioral scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMode {
    /// Report the raw metric value
    Absolute,
    /// Report the raw value divided by the reference circuit's raw value
    Relative(Reference),
}

impl Default for ScoreMode {
    fn default() -> Self {
        Self::Relative(Reference::FullCircuit)
    }
}

impl ScoreMode {
    pub fn is_relative(&self) -> bool {
        matches!(self, Self::Relative(_))
    }
}

/// `numerator / denominator`, failing on a zero denominator
pub(crate) fn checked_rate(
    numerator: f64,
    denominator: f64,
    what: &'static str,
) -> Result<f64> {
    if denominator == 0.0 {
        Err(CircuitError::DegenerateMetric(what))
    } else {
        Ok(numerator / denominator)
    }
}

/// `numerator / denominator`, with `0.0` for a zero denominator
pub(crate) fn rate_or_zero(numerator: f64, denominator: f64, what: &'static str) -> f64 {
    checked_rate(numerator, denominator, what).unwrap_or_else(|err| {
        debug!("{err}, using 0");
        0.0
    })
}

/// Set-membership confusion counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
}

impl ConfusionCounts {
    /// Count hypothesis vs ground truth membership over `universe`.
    ///
    /// Both sets are expected to be subsets of `universe`; otherwise the
    /// counts no longer add up to `|universe|`.
    pub fn from_sets<T: Eq + Hash>(
        hypothesis: &HashSet<T>,
        ground_truth: &HashSet<T>,
        universe: &HashSet<T>,
    ) -> Self {
        let true_positives = hypothesis.intersection(ground_truth).count();
        let false_positives = hypothesis.difference(ground_truth).count();
        let false_negatives = ground_truth.difference(hypothesis).count();
        let true_negatives = universe
            .iter()
            .filter(|x| !hypothesis.contains(*x) && !ground_truth.contains(*x))
            .count();
        Self {
            true_positives,
            false_positives,
            false_negatives,
            true_negatives,
        }
    }

    /// FP / (FP + TN), or 0 when nothing is negative
    pub fn fpr(&self) -> f64 {
        rate_or_zero(
            self.false_positives as f64,
            (self.false_positives + self.true_negatives) as f64,
            "FPR",
        )
    }

    /// TP / (TP + FN), or 0 when nothing is positive
    pub fn tpr(&self) -> f64 {
        rate_or_zero(
            self.true_positives as f64,
            (self.true_positives + self.false_negatives) as f64,
            "TPR",
        )
    }

    /// TP / (TP + FP), or 0 when the hypothesis is empty
    pub fn precision(&self) -> f64 {
        rate_or_zero(
            self.true_positives as f64,
            (self.true_positives + self.false_positives) as f64,
            "precision",
        )
    }

    /// Sum of all four counts
    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }
}

/// Node-level and edge-level comparison of two circuits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CircuitEvaluation {
    pub nodes: ConfusionCounts,
    pub edges: ConfusionCounts,
}

impl CircuitEvaluation {
    /// Flatten into a metric mapping for reporting sinks
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        for (prefix, counts) in [("nodes", &self.nodes), ("edges", &self.edges)] {
            metrics.insert(format!("{prefix}_fpr"), counts.fpr());
            metrics.insert(format!("{prefix}_tpr"), counts.tpr());
            metrics.insert(format!("{prefix}_tp"), counts.true_positives as f64);
            metrics.insert(format!("{prefix}_fp"), counts.false_positives as f64);
            metrics.insert(format!("{prefix}_fn"), counts.false_negatives as f64);
            metrics.insert(format!("{prefix}_tn"), counts.true_negatives as f64);
        }
        metrics
    }
}

/// Distance from 0 or 1 within which a mask score counts as binary
pub const BINARY_SCORE_TOLERANCE: f64 = 0.01;

/// Fraction of mask scores within [`BINARY_SCORE_TOLERANCE`] of 0 or 1.
///
/// Measures how decisively a learned mask has converged; an empty mask
/// gives 0.
pub fn proportion_of_binary_scores(scores: &[f64]) -> f64 {
    let binary = scores
        .iter()
        .filter(|&&s| s <= BINARY_SCORE_TOLERANCE || s >= 1.0 - BINARY_SCORE_TOLERANCE)
        .count();
    rate_or_zero(binary as f64, scores.len() as f64, "binary score proportion")
}

/// Fail if `circuit` has a node or edge outside `full`
pub fn check_within(circuit: &Circuit, full: &Circuit) -> Result<()> {
    if let Some(node) = circuit.sorted_nodes().into_iter().find(|n| !full.contains(n)) {
        return Err(CircuitError::UnknownComponent(node.to_string()));
    }
    if let Some(edge) = circuit
        .sorted_edges()
        .into_iter()
        .find(|e| !full.edges().contains(*e))
    {
        return Err(CircuitError::UnknownComponent(edge.to_string()));
    }
    Ok(())
}

/// Compare a hypothesis circuit with the ground truth.
///
/// `full` is the universe: every addressable component and every admissible
/// edge. Both circuits must lie within it.
pub fn evaluate_hypothesis_circuit(
    hypothesis: &Circuit,
    ground_truth: &Circuit,
    full: &Circuit,
) -> Result<CircuitEvaluation> {
    check_within(hypothesis, full)?;
    check_within(ground_truth, full)?;

    let evaluation = CircuitEvaluation {
        nodes: ConfusionCounts::from_sets(hypothesis.nodes(), ground_truth.nodes(), full.nodes()),
        edges: ConfusionCounts::from_sets(hypothesis.edges(), ground_truth.edges(), full.edges()),
    };
    debug!(
        "Nodes: TPR {:.3} FPR {:.3} | Edges: TPR {:.3} FPR {:.3}",
        evaluation.nodes.tpr(),
        evaluation.nodes.fpr(),
        evaluation.edges.tpr(),
        evaluation.edges.fpr()
    );
    Ok(evaluation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CircuitNode;
    use crate::universe::{ComponentUniverse, ModelShape};

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_four_node_scenario() {
        let universe = set(&["A", "B", "C", "D"]);
        let gt = set(&["A", "B"]);
        let hyp = set(&["B", "C"]);

        let counts = ConfusionCounts::from_sets(&hyp, &gt, &universe);
        assert_eq!(counts.true_positives, 1);
        assert_eq!(counts.false_positives, 1);
        assert_eq!(counts.false_negatives, 1);
        assert_eq!(counts.true_negatives, 1);
        assert_eq!(counts.total(), universe.len());
        assert!((counts.tpr() - 0.5).abs() < 1e-12);
        assert!((counts.fpr() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_denominators_give_zero() {
        let universe = set(&["A"]);
        let empty = set(&[]);
        // nothing positive, nothing negative in hypothesis
        let counts = ConfusionCounts::from_sets(&empty, &empty, &empty);
        assert_eq!(counts.tpr(), 0.0);
        assert_eq!(counts.fpr(), 0.0);
        assert_eq!(counts.precision(), 0.0);

        // everything is ground truth: FP + TN == 0
        let counts = ConfusionCounts::from_sets(&universe, &universe, &universe);
        assert_eq!(counts.fpr(), 0.0);
        assert_eq!(counts.tpr(), 1.0);
    }

    #[test]
    fn test_checked_rate() {
        assert!(matches!(
            checked_rate(1.0, 0.0, "FPR"),
            Err(CircuitError::DegenerateMetric("FPR"))
        ));
        assert_eq!(checked_rate(1.0, 4.0, "FPR").unwrap(), 0.25);
    }

    #[test]
    fn test_totals_match_universe() {
        let full = ModelShape::new(2, 2).full_circuit();
        let mut hyp = Circuit::new();
        hyp.add_edge(CircuitNode::embed(), CircuitNode::attention_head(0, 1));
        hyp.add_edge(CircuitNode::attention_head(0, 1), CircuitNode::mlp(1));
        let mut gt = Circuit::new();
        gt.add_edge(CircuitNode::attention_head(0, 1), CircuitNode::mlp(1));
        gt.add_node(CircuitNode::attention_head(1, 0));

        let eval = evaluate_hypothesis_circuit(&hyp, &gt, &full).unwrap();
        assert_eq!(eval.nodes.total(), full.len());
        assert_eq!(eval.edges.total(), full.edge_count());
        assert_eq!(eval.nodes.true_positives, 2);
        assert_eq!(eval.nodes.false_positives, 1);
        assert_eq!(eval.nodes.false_negatives, 1);
        assert_eq!(eval.edges.true_positives, 1);
        assert_eq!(eval.edges.false_positives, 1);
        assert_eq!(eval.edges.false_negatives, 0);
        assert_eq!(eval.edges.tpr(), 1.0);
    }

    #[test]
    fn test_unknown_component_rejected() {
        let full = ModelShape::new(1, 1).full_circuit();
        let mut hyp = Circuit::new();
        hyp.add_node(CircuitNode::attention_head(3, 0));
        assert!(matches!(
            evaluate_hypothesis_circuit(&hyp, &Circuit::new(), &full),
            Err(CircuitError::UnknownComponent(_))
        ));

        // known nodes, inadmissible edge
        let mut hyp = Circuit::new();
        hyp.add_edge(CircuitNode::mlp(0), CircuitNode::embed());
        assert!(matches!(
            evaluate_hypothesis_circuit(&hyp, &Circuit::new(), &full),
            Err(CircuitError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_to_metrics_keys() {
        let metrics = CircuitEvaluation::default().to_metrics();
        for key in ["nodes_fpr", "nodes_tpr", "edges_fpr", "edges_tpr", "edges_tn"] {
            assert!(metrics.contains_key(key), "missing {key}");
        }
        assert_eq!(metrics["nodes_tpr"], 0.0);
    }

    #[test]
    fn test_proportion_of_binary_scores() {
        assert_eq!(proportion_of_binary_scores(&[]), 0.0);
        assert_eq!(proportion_of_binary_scores(&[0.0, 1.0, 0.995, 0.004]), 1.0);

        let p = proportion_of_binary_scores(&[0.0, 0.5, 0.98, 1.0]);
        assert!((p - 0.5).abs() < 1e-12);
        // NaN scores are never binary
        assert_eq!(proportion_of_binary_scores(&[f64::NAN]), 0.0);
    }

    #[test]
    fn test_score_mode_default_is_relative_to_full() {
        assert_eq!(ScoreMode::default(), ScoreMode::Relative(Reference::FullCircuit));
        assert!(!ScoreMode::Absolute.is_relative());
    }
}
