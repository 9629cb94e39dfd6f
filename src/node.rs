//! Circuit nodes: addressable units of a transformer
//!
//! A node is a hook name plus an optional head index. Attention heads share
//! one hook per layer and are told apart by the index; MLP blocks and
//! embeddings are addressed as whole tensors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CircuitError;

/// Hook name of the token embedding
pub const EMBED_HOOK: &str = "hook_embed";

/// Hook name of the positional embedding
pub const POS_EMBED_HOOK: &str = "hook_pos_embed";

/// One addressable component of the model.
///
/// Two nodes are equal iff both `name` and `index` are equal. Ordering is by
/// name, then index, which gives stable display order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CircuitNode {
    name: String,
    index: Option<usize>,
}

/// Structural classification of a node derived from its hook name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// Token embedding
    Embed,
    /// Positional embedding
    PosEmbed,
    /// A single attention head
    AttentionHead { layer: usize, head: usize },
    /// A whole MLP block
    Mlp { layer: usize },
    /// Any other hook (residual stream points, whole attention outputs, ...)
    Other,
}

impl CircuitNode {
    /// Create a node from a hook name and optional sub-index
    pub fn new(name: impl Into<String>, index: Option<usize>) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Node addressing a whole hook tensor
    pub fn whole(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Attention head `head` of layer `layer`
    pub fn attention_head(layer: usize, head: usize) -> Self {
        Self::new(format!("blocks.{layer}.attn.hook_result"), Some(head))
    }

    /// MLP block of layer `layer`
    pub fn mlp(layer: usize) -> Self {
        Self::whole(format!("blocks.{layer}.hook_mlp_out"))
    }

    /// Token embedding
    pub fn embed() -> Self {
        Self::whole(EMBED_HOOK)
    }

    /// Positional embedding
    pub fn pos_embed() -> Self {
        Self::whole(POS_EMBED_HOOK)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Classify the node by its hook name
    pub fn kind(&self) -> ComponentKind {
        if self.name == EMBED_HOOK {
            return ComponentKind::Embed;
        }
        if self.name == POS_EMBED_HOOK {
            return ComponentKind::PosEmbed;
        }
        let Some(layer) = self.layer() else {
            return ComponentKind::Other;
        };
        let suffix = self
            .name
            .split_once('.')
            .and_then(|(_, rest)| rest.split_once('.'))
            .map_or("", |(_, suffix)| suffix);
        match (suffix, self.index) {
            ("attn.hook_result", Some(head)) => ComponentKind::AttentionHead { layer, head },
            ("hook_mlp_out", None) => ComponentKind::Mlp { layer },
            _ => ComponentKind::Other,
        }
    }

    /// Layer number for `blocks.{layer}.*` hooks
    pub fn layer(&self) -> Option<usize> {
        let rest = self.name.strip_prefix("blocks.")?;
        let (layer, _) = rest.split_once('.')?;
        layer.parse().ok()
    }

    /// True for attention head nodes
    pub fn is_attention(&self) -> bool {
        matches!(self.kind(), ComponentKind::AttentionHead { .. })
    }
}

impl fmt::Display for CircuitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}[{index}]", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for CircuitNode {
    type Err = CircuitError;

    /// Parse the display form back into a node
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CircuitError::InvalidConfig("empty node name".into()));
        }
        if let Some(body) = s.strip_suffix(']') {
            let (name, index) = body
                .rsplit_once('[')
                .ok_or_else(|| CircuitError::InvalidConfig(format!("malformed node `{s}`")))?;
            let index = index
                .parse()
                .map_err(|_| CircuitError::InvalidConfig(format!("malformed index in `{s}`")))?;
            if name.is_empty() {
                return Err(CircuitError::InvalidConfig(format!("malformed node `{s}`")));
            }
            return Ok(Self::new(name, Some(index)));
        }
        Ok(Self::whole(s))
    }
}
