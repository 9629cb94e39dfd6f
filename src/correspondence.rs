//! High-level to low-level correspondence
//!
//! Maps nodes of a symbolic (high-level) computational graph to the sets of
//! model components (low-level nodes) that implement them. One symbolic
//! operation may be implemented by zero, one or several components.
//!
//! ## Policies
//!
//! Both conflict cases are explicit choices at the API boundary:
//! - re-registering a high-level node: [`MappingPolicy`] (reject, overwrite, merge)
//! - one component claimed by two high-level nodes: [`OverlapPolicy`]
//!
//! ## Expansion
//!
//! [`Correspondence::to_low_level_circuit`] turns every high-level edge
//! `u -> v` into the complete bipartite edge set `low(u) x low(v)`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit::Circuit;
use crate::error::{CircuitError, Result};
use crate::node::CircuitNode;

/// Identifier of a node in the high-level (symbolic) graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HighLevelNode(String);

impl HighLevelNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HighLevelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HighLevelNode {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for HighLevelNode {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// What to do when a high-level node is registered twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MappingPolicy {
    /// Fail with `DuplicateMapping`
    #[default]
    Reject,
    /// Replace the existing mapping
    Overwrite,
    /// Union with the existing mapping
    Merge,
}

/// Whether different high-level nodes may share low-level components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Shared components are ambiguous and rejected
    #[default]
    Forbid,
    /// Shared implementation is allowed
    Allow,
}

/// Mapping from a high-level graph onto model components
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correspondence {
    mapping: BTreeMap<HighLevelNode, BTreeSet<CircuitNode>>,
    edges: BTreeSet<(HighLevelNode, HighLevelNode)>,
    #[serde(default)]
    overlap: OverlapPolicy,
}

impl Correspondence {
    /// Create an empty correspondence that forbids overlapping mappings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty correspondence with the given overlap policy
    pub fn with_overlap(overlap: OverlapPolicy) -> Self {
        Self {
            overlap,
            ..Self::default()
        }
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap
    }

    /// Register the low-level nodes implementing `id`.
    ///
    /// Fails with `DuplicateMapping` if `id` is already mapped.
    pub fn add_correspondence(
        &mut self,
        id: impl Into<HighLevelNode>,
        nodes: impl IntoIterator<Item = CircuitNode>,
    ) -> Result<()> {
        self.add_correspondence_with(id, nodes, MappingPolicy::Reject)
    }

    /// Register or extend the mapping for `id` under an explicit policy
    pub fn add_correspondence_with(
        &mut self,
        id: impl Into<HighLevelNode>,
        nodes: impl IntoIterator<Item = CircuitNode>,
        policy: MappingPolicy,
    ) -> Result<()> {
        let id = id.into();
        let nodes: BTreeSet<CircuitNode> = nodes.into_iter().collect();

        if self.mapping.contains_key(&id) && policy == MappingPolicy::Reject {
            return Err(CircuitError::DuplicateMapping(id.to_string()));
        }

        if self.overlap == OverlapPolicy::Forbid {
            for node in &nodes {
                if let Some(owner) = self.owner_other_than(node, &id) {
                    return Err(CircuitError::AmbiguousMapping {
                        node: node.to_string(),
                        first: owner.to_string(),
                        second: id.to_string(),
                    });
                }
            }
        }

        match policy {
            MappingPolicy::Merge => {
                self.mapping.entry(id).or_default().extend(nodes);
            }
            MappingPolicy::Reject | MappingPolicy::Overwrite => {
                self.mapping.insert(id, nodes);
            }
        }
        Ok(())
    }

    /// First high-level node other than `id` that claims `node`
    fn owner_other_than(&self, node: &CircuitNode, id: &HighLevelNode) -> Option<&HighLevelNode> {
        self.mapping
            .iter()
            .find(|(owner, nodes)| *owner != id && nodes.contains(node))
            .map(|(owner, _)| owner)
    }

    /// Add a directed edge of the high-level graph. Both ends must be registered.
    pub fn add_high_level_edge(
        &mut self,
        from: impl Into<HighLevelNode>,
        to: impl Into<HighLevelNode>,
    ) -> Result<()> {
        let (from, to) = (from.into(), to.into());
        for id in [&from, &to] {
            if !self.mapping.contains_key(id) {
                return Err(CircuitError::UnknownHighLevelNode(id.to_string()));
            }
        }
        self.edges.insert((from, to));
        Ok(())
    }

    /// Low-level nodes implementing `id`
    pub fn lookup(&self, id: &HighLevelNode) -> Result<&BTreeSet<CircuitNode>> {
        self.mapping
            .get(id)
            .ok_or_else(|| CircuitError::UnknownHighLevelNode(id.to_string()))
    }

    /// Registered high-level nodes
    pub fn high_level_nodes(&self) -> impl Iterator<Item = &HighLevelNode> {
        self.mapping.keys()
    }

    /// High-level edges
    pub fn high_level_edges(&self) -> impl Iterator<Item = &(HighLevelNode, HighLevelNode)> {
        self.edges.iter()
    }

    /// Number of registered high-level nodes
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Materialize the low-level circuit.
    ///
    /// Nodes are the union of all mapped components. Each high-level edge
    /// contributes `|low(from)| * |low(to)|` edges; a component shared by
    /// both ends never gets a self-edge.
    pub fn to_low_level_circuit(&self) -> Circuit {
        let mut circuit: Circuit = self.mapping.values().flatten().cloned().collect();
        for (from, to) in &self.edges {
            // add_high_level_edge guarantees both ends are mapped
            let (Some(sources), Some(targets)) = (self.mapping.get(from), self.mapping.get(to))
            else {
                continue;
            };
            for source in sources {
                for target in targets {
                    if source != target {
                        circuit.add_edge(source.clone(), target.clone());
                    }
                }
            }
        }
        debug!(
            "Expanded {} high-level nodes / {} edges into {} components / {} edges",
            self.mapping.len(),
            self.edges.len(),
            circuit.len(),
            circuit.edge_count()
        );
        circuit
    }

    /// Ground-truth circuit in the node space of `full`.
    ///
    /// Every mapped component must exist in `full`. Expanded edges that the
    /// full circuit does not admit (e.g. against layer order) are dropped.
    pub fn ground_truth_circuit(&self, full: &Circuit) -> Result<Circuit> {
        let expanded = self.to_low_level_circuit();
        if let Some(unknown) = expanded.sorted_nodes().into_iter().find(|n| !full.contains(n)) {
            return Err(CircuitError::UnknownComponent(unknown.to_string()));
        }
        let restricted = expanded.restrict_to(full);
        let dropped = expanded.edge_count() - restricted.edge_count();
        if dropped > 0 {
            debug!("Dropped {dropped} expanded edges not admitted by the full circuit");
        }
        Ok(restricted)
    }

    /// Write the correspondence to `path` as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load a correspondence written by [`Correspondence::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::{ComponentUniverse, ModelShape};

    fn heads(layer: usize, heads: &[usize]) -> Vec<CircuitNode> {
        heads
            .iter()
            .map(|&h| CircuitNode::attention_head(layer, h))
            .collect()
    }

    #[test]
    fn test_lookup() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("select", heads(0, &[0, 1])).unwrap();

        let found = corr.lookup(&"select".into()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(matches!(
            corr.lookup(&"missing".into()),
            Err(CircuitError::UnknownHighLevelNode(_))
        ));
    }

    #[test]
    fn test_duplicate_rejected_by_default() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("map", vec![CircuitNode::mlp(0)]).unwrap();
        let err = corr
            .add_correspondence("map", vec![CircuitNode::mlp(1)])
            .unwrap_err();
        assert!(matches!(err, CircuitError::DuplicateMapping(ref id) if id == "map"));
        assert_eq!(corr.lookup(&"map".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_overwrite_and_merge() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("map", vec![CircuitNode::mlp(0)]).unwrap();

        corr.add_correspondence_with("map", vec![CircuitNode::mlp(1)], MappingPolicy::Overwrite)
            .unwrap();
        let found = corr.lookup(&"map".into()).unwrap();
        assert_eq!(found.iter().collect::<Vec<_>>(), vec![&CircuitNode::mlp(1)]);

        corr.add_correspondence_with("map", vec![CircuitNode::mlp(0)], MappingPolicy::Merge)
            .unwrap();
        assert_eq!(corr.lookup(&"map".into()).unwrap().len(), 2);
    }

    #[test]
    fn test_overlap_forbidden_by_default() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("a", heads(0, &[0])).unwrap();
        let err = corr.add_correspondence("b", heads(0, &[0, 1])).unwrap_err();
        assert!(matches!(err, CircuitError::AmbiguousMapping { .. }));
        // failed registration leaves no trace
        assert!(corr.lookup(&"b".into()).is_err());
    }

    #[test]
    fn test_overlap_allowed() {
        let mut corr = Correspondence::with_overlap(OverlapPolicy::Allow);
        corr.add_correspondence("a", heads(0, &[0])).unwrap();
        corr.add_correspondence("b", heads(0, &[0, 1])).unwrap();
        corr.add_high_level_edge("a", "b").unwrap();

        let circuit = corr.to_low_level_circuit();
        // shared head 0 never points at itself
        assert_eq!(circuit.edge_count(), 1);
        assert!(circuit.contains_edge(
            &CircuitNode::attention_head(0, 0),
            &CircuitNode::attention_head(0, 1)
        ));
    }

    #[test]
    fn test_edge_requires_registered_nodes() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("a", heads(0, &[0])).unwrap();
        assert!(matches!(
            corr.add_high_level_edge("a", "b"),
            Err(CircuitError::UnknownHighLevelNode(ref id)) if id == "b"
        ));
    }

    #[test]
    fn test_bipartite_expansion() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("tokens", vec![CircuitNode::embed()]).unwrap();
        corr.add_correspondence("select", heads(0, &[0, 1, 2])).unwrap();
        corr.add_correspondence("aggregate", vec![CircuitNode::mlp(0), CircuitNode::mlp(1)])
            .unwrap();
        corr.add_correspondence("unused", Vec::new()).unwrap();
        corr.add_high_level_edge("tokens", "select").unwrap();
        corr.add_high_level_edge("select", "aggregate").unwrap();

        let circuit = corr.to_low_level_circuit();
        assert_eq!(circuit.len(), 6);
        // 1x3 + 3x2
        assert_eq!(circuit.edge_count(), 3 + 6);
        for head in heads(0, &[0, 1, 2]) {
            assert!(circuit.contains_edge(&CircuitNode::embed(), &head));
            assert!(circuit.contains_edge(&head, &CircuitNode::mlp(1)));
        }
    }

    #[test]
    fn test_ground_truth_circuit() {
        let full = ModelShape::new(2, 2).full_circuit();

        let mut corr = Correspondence::new();
        corr.add_correspondence("late", vec![CircuitNode::mlp(1)]).unwrap();
        corr.add_correspondence("early", heads(0, &[1])).unwrap();
        corr.add_high_level_edge("early", "late").unwrap();
        // against layer order: dropped
        corr.add_high_level_edge("late", "early").unwrap();

        let gt = corr.ground_truth_circuit(&full).unwrap();
        assert_eq!(gt.len(), 2);
        assert_eq!(gt.edge_count(), 1);

        let mut bad = Correspondence::new();
        bad.add_correspondence("x", heads(7, &[0])).unwrap();
        assert!(matches!(
            bad.ground_truth_circuit(&full),
            Err(CircuitError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let mut corr = Correspondence::new();
        corr.add_correspondence("a", heads(0, &[0])).unwrap();
        corr.add_correspondence("b", vec![CircuitNode::mlp(0)]).unwrap();
        corr.add_high_level_edge("a", "b").unwrap();

        let json = serde_json::to_string(&corr).unwrap();
        let restored: Correspondence = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, corr);
    }
}
