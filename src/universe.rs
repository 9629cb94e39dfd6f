//! Component universe of a compiled transformer
//!
//! Enumerates every addressable node of a model (embeddings, attention
//! heads, MLP blocks) and builds the full circuit: all components plus every
//! edge the residual stream allows.
//!
//! ## Edge rule
//!
//! A component can read anything written to the residual stream before it:
//! - embeddings feed every attention head and MLP
//! - layer `l` attention heads feed every later attention head, the MLP of
//!   layer `l` and every later MLP
//! - layer `l` MLP feeds every component of layers `> l`

use serde::{Deserialize, Serialize};

use crate::circuit::{Circuit, CircuitEdge};
use crate::error::{CircuitError, Result};
use crate::node::{CircuitNode, ComponentKind};

/// Anything that can enumerate the addressable components of a model
pub trait ComponentUniverse {
    /// All addressable components
    fn components(&self) -> Vec<CircuitNode>;

    /// Every component and every admissible edge between them
    fn full_circuit(&self) -> Circuit;
}

/// Shape of a transformer in terms of addressable components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelShape {
    /// Number of transformer blocks
    pub n_layers: usize,
    /// Attention heads per block
    pub n_heads: usize,
    /// Include the token embedding node
    pub include_embed: bool,
    /// Include the positional embedding node
    pub include_pos_embed: bool,
}

impl ModelShape {
    /// Attention heads and MLPs plus both embedding nodes
    pub fn new(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            include_embed: true,
            include_pos_embed: true,
        }
    }

    /// Drop the token embedding node
    pub fn without_embed(mut self) -> Self {
        self.include_embed = false;
        self
    }

    /// Drop the positional embedding node
    pub fn without_pos_embed(mut self) -> Self {
        self.include_pos_embed = false;
        self
    }

    /// Number of components in the universe
    pub fn n_components(&self) -> usize {
        self.n_layers * (self.n_heads + 1)
            + usize::from(self.include_embed)
            + usize::from(self.include_pos_embed)
    }

    /// Check that a node belongs to this model
    pub fn validate_node(&self, node: &CircuitNode) -> Result<()> {
        let valid = match node.kind() {
            ComponentKind::Embed => self.include_embed,
            ComponentKind::PosEmbed => self.include_pos_embed,
            ComponentKind::AttentionHead { layer, head } => {
                layer < self.n_layers && head < self.n_heads
            }
            ComponentKind::Mlp { layer } => layer < self.n_layers,
            ComponentKind::Other => false,
        };
        if valid {
            Ok(())
        } else {
            Err(CircuitError::UnknownComponent(node.to_string()))
        }
    }

    fn embeddings(&self) -> Vec<CircuitNode> {
        let mut nodes = Vec::with_capacity(2);
        if self.include_embed {
            nodes.push(CircuitNode::embed());
        }
        if self.include_pos_embed {
            nodes.push(CircuitNode::pos_embed());
        }
        nodes
    }

    fn heads(&self, layer: usize) -> impl Iterator<Item = CircuitNode> {
        (0..self.n_heads).map(move |head| CircuitNode::attention_head(layer, head))
    }
}

impl ComponentUniverse for ModelShape {
    fn components(&self) -> Vec<CircuitNode> {
        let mut nodes = self.embeddings();
        for layer in 0..self.n_layers {
            nodes.extend(self.heads(layer));
            nodes.push(CircuitNode::mlp(layer));
        }
        nodes
    }

    fn full_circuit(&self) -> Circuit {
        let mut circuit: Circuit = self.components().into_iter().collect();

        // Everything written so far to the residual stream
        let mut upstream = self.embeddings();
        for layer in 0..self.n_layers {
            let heads: Vec<CircuitNode> = self.heads(layer).collect();
            let mlp = CircuitNode::mlp(layer);

            for head in &heads {
                for source in &upstream {
                    circuit.add_edge(source.clone(), head.clone());
                }
            }
            for source in upstream.iter().chain(&heads) {
                circuit.add_edge(source.clone(), mlp.clone());
            }

            upstream.extend(heads);
            upstream.push(mlp);
        }
        circuit
    }
}

/// Every edge of the full circuit, as a list
pub fn all_edges(universe: &impl ComponentUniverse) -> Vec<CircuitEdge> {
    universe.full_circuit().edges().iter().cloned().collect()
}
