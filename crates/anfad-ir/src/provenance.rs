//! Optional provenance side-annotations.
//!
//! Transforms that derive new nodes and graphs from existing ones may
//! record where each derived entity came from and in what role. The table
//! is purely diagnostic: nothing on the correctness path reads it, and a
//! program with an empty table behaves identically.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::id::{GraphId, NodeId};

/// The role a derived entity plays relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The forward (tagged) counterpart of a source graph.
    ForwardGraph,
    /// The backpropagator counterpart of a source graph.
    BackpropGraph,
    /// The tagged counterpart of a source node.
    Tagged,
    /// The backpropagator value associated with a source apply node.
    BackpropValue,
    /// An accumulated sensitivity for a source node.
    Sensitivity,
}

/// A derived node's link back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProvenance {
    pub source: NodeId,
    pub role: Role,
}

/// A derived graph's link back to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphProvenance {
    pub source: GraphId,
    pub role: Role,
}

/// Side table mapping derived entities to their sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvenanceTable {
    pub(crate) nodes: IndexMap<NodeId, NodeProvenance>,
    pub(crate) graphs: IndexMap<GraphId, GraphProvenance>,
}

impl ProvenanceTable {
    /// Looks up the provenance of a derived node.
    pub fn node(&self, id: NodeId) -> Option<&NodeProvenance> {
        self.nodes.get(&id)
    }

    /// Looks up the provenance of a derived graph.
    pub fn graph(&self, id: GraphId) -> Option<&GraphProvenance> {
        self.graphs.get(&id)
    }

    /// Number of annotated entities.
    pub fn len(&self) -> usize {
        self.nodes.len() + self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.graphs.is_empty()
    }
}
