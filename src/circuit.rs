//! Circuit container: a set of nodes and directed edges between them
//!
//! A circuit is a subgraph of model components hypothesized (or known) to
//! implement a behavior. Edges always point from an upstream component to a
//! downstream one.
//!
//! ## Invariants
//!
//! - Both endpoints of every edge are in the node set. `add_edge` inserts
//!   missing endpoints; `remove_node` cascades to every incident edge.
//! - No duplicate nodes or edges.
//! - Membership is a hash lookup.
//!
//! Incident edges are tracked in an adjacency index that is updated on every
//! mutation, so removing a node touches only its own edges.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::node::CircuitNode;

/// A directed edge from an upstream component to a downstream one
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitEdge {
    /// Upstream component
    pub from: CircuitNode,
    /// Downstream component
    pub to: CircuitNode,
}

impl CircuitEdge {
    /// Create a new edge
    pub fn new(from: CircuitNode, to: CircuitNode) -> Self {
        Self { from, to }
    }

    /// The endpoint opposite to `node` (the node itself for self-loops)
    fn other(&self, node: &CircuitNode) -> &CircuitNode {
        if &self.from == node {
            &self.to
        } else {
            &self.from
        }
    }
}

impl fmt::Display for CircuitEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Mutable collection of circuit nodes and edges
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "CircuitFile", from = "CircuitFile")]
pub struct Circuit {
    nodes: HashSet<CircuitNode>,
    edges: HashSet<CircuitEdge>,
    /// node -> edges that start or end at it
    incident: HashMap<CircuitNode, HashSet<CircuitEdge>>,
}

/// On-disk layout: sorted node and edge lists
#[derive(Serialize, Deserialize)]
struct CircuitFile {
    nodes: Vec<CircuitNode>,
    edges: Vec<CircuitEdge>,
}

impl From<Circuit> for CircuitFile {
    fn from(circuit: Circuit) -> Self {
        Self {
            nodes: circuit.sorted_nodes().into_iter().cloned().collect(),
            edges: circuit.sorted_edges().into_iter().cloned().collect(),
        }
    }
}

impl From<CircuitFile> for Circuit {
    fn from(file: CircuitFile) -> Self {
        let mut circuit = Circuit::new();
        for node in file.nodes {
            circuit.add_node(node);
        }
        for edge in file.edges {
            circuit.add_edge(edge.from, edge.to);
        }
        circuit
    }
}

impl Circuit {
    /// Create an empty circuit
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a circuit from a list of edges (endpoints are added automatically)
    pub fn from_edges(edges: impl IntoIterator<Item = CircuitEdge>) -> Self {
        let mut circuit = Self::new();
        for edge in edges {
            circuit.add_edge(edge.from, edge.to);
        }
        circuit
    }

    /// Build a circuit from a discovery algorithm's edge mask.
    ///
    /// Only edges marked present are kept; nodes that appear solely on
    /// absent edges are not part of the circuit.
    pub fn from_edge_mask(mask: impl IntoIterator<Item = (CircuitEdge, bool)>) -> Self {
        let mut circuit = Self::new();
        let mut dropped = 0usize;
        for (edge, present) in mask {
            if present {
                circuit.add_edge(edge.from, edge.to);
            } else {
                dropped += 1;
            }
        }
        debug!(
            "Built circuit from edge mask: {} nodes, {} edges ({} absent)",
            circuit.len(),
            circuit.edge_count(),
            dropped
        );
        circuit
    }

    /// Insert a node. Returns `false` if it was already present.
    pub fn add_node(&mut self, node: CircuitNode) -> bool {
        if self.nodes.contains(&node) {
            return false;
        }
        self.incident.insert(node.clone(), HashSet::new());
        self.nodes.insert(node)
    }

    /// Remove a node together with every edge incident to it.
    ///
    /// Returns `false` if the node was not present.
    pub fn remove_node(&mut self, node: &CircuitNode) -> bool {
        if !self.nodes.remove(node) {
            return false;
        }
        let incident = self.incident.remove(node).unwrap_or_default();
        for edge in incident {
            self.edges.remove(&edge);
            let other = edge.other(node);
            if other != node {
                if let Some(set) = self.incident.get_mut(other) {
                    set.remove(&edge);
                }
            }
        }
        true
    }

    /// Insert an edge, adding missing endpoints first.
    ///
    /// Returns `false` if the edge was already present.
    pub fn add_edge(&mut self, from: CircuitNode, to: CircuitNode) -> bool {
        self.add_node(from.clone());
        self.add_node(to.clone());
        let edge = CircuitEdge::new(from, to);
        if !self.edges.insert(edge.clone()) {
            return false;
        }
        for endpoint in [&edge.from, &edge.to] {
            if let Some(set) = self.incident.get_mut(endpoint) {
                set.insert(edge.clone());
            }
        }
        true
    }

    /// Remove an edge, leaving its endpoints in place.
    ///
    /// Returns `false` if the edge was not present.
    pub fn remove_edge(&mut self, from: &CircuitNode, to: &CircuitNode) -> bool {
        let edge = CircuitEdge::new(from.clone(), to.clone());
        if !self.edges.remove(&edge) {
            return false;
        }
        for endpoint in [from, to] {
            if let Some(set) = self.incident.get_mut(endpoint) {
                set.remove(&edge);
            }
        }
        true
    }

    /// Node membership test
    pub fn contains(&self, node: &CircuitNode) -> bool {
        self.nodes.contains(node)
    }

    /// Edge membership test
    pub fn contains_edge(&self, from: &CircuitNode, to: &CircuitNode) -> bool {
        self.edges.contains(&CircuitEdge::new(from.clone(), to.clone()))
    }

    /// Read-only view of the node set
    pub fn nodes(&self) -> &HashSet<CircuitNode> {
        &self.nodes
    }

    /// Read-only view of the edge set
    pub fn edges(&self) -> &HashSet<CircuitEdge> {
        &self.edges
    }

    /// Iterate over nodes. Order is stable while the circuit is not mutated.
    pub fn iter(&self) -> impl Iterator<Item = &CircuitNode> + '_ {
        self.nodes.iter()
    }

    /// Nodes with an edge coming from `node`
    pub fn successors<'a>(&'a self, node: &'a CircuitNode) -> impl Iterator<Item = &'a CircuitNode> {
        self.incident
            .get(node)
            .into_iter()
            .flatten()
            .filter(move |edge| &edge.from == node)
            .map(|edge| &edge.to)
    }

    /// Nodes with an edge going into `node`
    pub fn predecessors<'a>(
        &'a self,
        node: &'a CircuitNode,
    ) -> impl Iterator<Item = &'a CircuitNode> {
        self.incident
            .get(node)
            .into_iter()
            .flatten()
            .filter(move |edge| &edge.to == node)
            .map(|edge| &edge.from)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the circuit has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Nodes in sorted order, for display and serialization
    pub fn sorted_nodes(&self) -> Vec<&CircuitNode> {
        let mut nodes: Vec<_> = self.nodes.iter().collect();
        nodes.sort();
        nodes
    }

    /// Edges in sorted order, for display and serialization
    pub fn sorted_edges(&self) -> Vec<&CircuitEdge> {
        let mut edges: Vec<_> = self.edges.iter().collect();
        edges.sort();
        edges
    }

    /// Keep only the nodes and edges that are also in `other`
    pub fn restrict_to(&self, other: &Circuit) -> Circuit {
        let mut restricted = Circuit::new();
        for node in self.nodes.iter().filter(|n| other.contains(n)) {
            restricted.add_node(node.clone());
        }
        for edge in self.edges.iter().filter(|e| other.edges.contains(*e)) {
            restricted.add_edge(edge.from.clone(), edge.to.clone());
        }
        restricted
    }

    /// Serialize the circuit state to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Rebuild a circuit from bytes produced by [`Circuit::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Write the circuit to `path`
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a circuit written by [`Circuit::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read(path)?;
        Self::from_bytes(&content)
    }
}

impl PartialEq for Circuit {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes && self.edges == other.edges
    }
}

impl Eq for Circuit {}

impl<'a> IntoIterator for &'a Circuit {
    type Item = &'a CircuitNode;
    type IntoIter = std::collections::hash_set::Iter<'a, CircuitNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

impl FromIterator<CircuitNode> for Circuit {
    fn from_iter<I: IntoIterator<Item = CircuitNode>>(iter: I) -> Self {
        let mut circuit = Circuit::new();
        for node in iter {
            circuit.add_node(node);
        }
        circuit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn head(layer: usize, head: usize) -> CircuitNode {
        CircuitNode::attention_head(layer, head)
    }

    #[test]
    fn test_add_node_idempotent() {
        let mut circuit = Circuit::new();
        assert!(circuit.add_node(head(0, 0)));
        assert!(!circuit.add_node(head(0, 0)));
        assert_eq!(circuit.len(), 1);
    }

    #[test]
    fn test_add_edge_adds_endpoints() {
        let mut circuit = Circuit::new();
        let (a, b) = (head(0, 0), CircuitNode::mlp(0));
        assert!(circuit.add_edge(a.clone(), b.clone()));
        assert!(circuit.contains(&a));
        assert!(circuit.contains(&b));
        assert!(circuit.contains_edge(&a, &b));
        assert!(!circuit.contains_edge(&b, &a));

        // no duplicate edges
        assert!(!circuit.add_edge(a, b));
        assert_eq!(circuit.edge_count(), 1);
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut circuit = Circuit::new();
        let (a, b, c) = (CircuitNode::embed(), head(0, 0), CircuitNode::mlp(0));
        circuit.add_edge(a.clone(), b.clone());
        circuit.add_edge(b.clone(), c.clone());
        circuit.add_edge(a.clone(), c.clone());

        assert!(circuit.remove_node(&b));
        assert!(!circuit.contains(&b));
        assert_eq!(circuit.edge_count(), 1);
        assert!(circuit.contains_edge(&a, &c));
        assert_eq!(circuit.successors(&a).count(), 1);
        assert_eq!(circuit.predecessors(&c).count(), 1);

        // absent node is a no-op
        assert!(!circuit.remove_node(&b));
    }

    #[test]
    fn test_remove_node_with_self_loop() {
        let mut circuit = Circuit::new();
        let a = head(1, 1);
        circuit.add_edge(a.clone(), a.clone());
        assert!(circuit.remove_node(&a));
        assert!(circuit.is_empty());
        assert_eq!(circuit.edge_count(), 0);
    }

    #[test]
    fn test_remove_edge_keeps_nodes() {
        let mut circuit = Circuit::new();
        let (a, b) = (head(0, 1), CircuitNode::mlp(1));
        circuit.add_edge(a.clone(), b.clone());
        assert!(circuit.remove_edge(&a, &b));
        assert!(!circuit.remove_edge(&a, &b));
        assert_eq!(circuit.len(), 2);
        assert_eq!(circuit.edge_count(), 0);
        assert_eq!(circuit.successors(&a).count(), 0);
    }

    #[test]
    fn test_add_then_remove_restores_nodes() {
        let mut rng = StdRng::seed_from_u64(42);
        let pool: Vec<CircuitNode> = (0..3)
            .flat_map(|l| (0..3).map(move |h| head(l, h)))
            .chain((0..3).map(CircuitNode::mlp))
            .collect();

        for _ in 0..50 {
            let mut circuit = Circuit::new();
            for _ in 0..10 {
                let from = pool[rng.gen_range(0..pool.len())].clone();
                let to = pool[rng.gen_range(0..pool.len())].clone();
                circuit.add_edge(from, to);
            }
            let fresh = CircuitNode::whole("hook_fresh");
            let before = circuit.nodes().clone();

            circuit.add_node(fresh.clone());
            for node in before.iter().take(3) {
                circuit.add_edge(fresh.clone(), node.clone());
                circuit.add_edge(node.clone(), fresh.clone());
            }
            circuit.remove_node(&fresh);

            assert_eq!(circuit.nodes(), &before);
            assert!(circuit
                .edges()
                .iter()
                .all(|e| e.from != fresh && e.to != fresh));
            assert!(circuit
                .edges()
                .iter()
                .all(|e| circuit.contains(&e.from) && circuit.contains(&e.to)));
        }
    }

    #[test]
    fn test_iteration_is_restartable() {
        let circuit: Circuit = [head(0, 0), head(0, 1), CircuitNode::mlp(0)]
            .into_iter()
            .collect();
        let first: Vec<_> = circuit.iter().collect();
        let second: Vec<_> = (&circuit).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut circuit = Circuit::new();
        circuit.add_edge(CircuitNode::embed(), head(0, 2));
        circuit.add_edge(head(0, 2), CircuitNode::mlp(0));
        circuit.add_node(head(1, 0));

        let bytes = circuit.to_bytes().unwrap();
        let restored = Circuit::from_bytes(&bytes).unwrap();
        assert_eq!(restored, circuit);

        // index was rebuilt
        let mut restored = restored;
        restored.remove_node(&head(0, 2));
        assert_eq!(restored.edge_count(), 0);
    }

    #[test]
    fn test_from_edge_mask() {
        let a = CircuitNode::embed();
        let b = head(0, 0);
        let c = CircuitNode::mlp(0);
        let circuit = Circuit::from_edge_mask(vec![
            (CircuitEdge::new(a.clone(), b.clone()), true),
            (CircuitEdge::new(a.clone(), c.clone()), false),
        ]);
        assert!(circuit.contains(&a));
        assert!(circuit.contains(&b));
        assert!(!circuit.contains(&c));
        assert_eq!(circuit.edge_count(), 1);
    }

    #[test]
    fn test_restrict_to() {
        let mut full = Circuit::new();
        full.add_edge(CircuitNode::embed(), head(0, 0));
        full.add_edge(head(0, 0), CircuitNode::mlp(0));

        let mut other = Circuit::new();
        other.add_edge(head(0, 0), CircuitNode::mlp(0));
        other.add_edge(CircuitNode::mlp(0), head(0, 0));
        other.add_node(head(5, 5));

        let restricted = other.restrict_to(&full);
        assert_eq!(restricted.len(), 2);
        assert_eq!(restricted.edge_count(), 1);
        assert!(restricted.contains_edge(&head(0, 0), &CircuitNode::mlp(0)));
    }
}
