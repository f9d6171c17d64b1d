//! Error types for the IR crate.
//!
//! Uses `thiserror` for structured, matchable variants. These cover
//! detectable malformations of input programs; internal consistency
//! violations (dangling IDs handed to arena indexing, empty apply input
//! lists) are programming defects and panic instead.

use thiserror::Error;

use crate::id::{GraphId, NodeId};

/// Errors produced by IR traversals and analyses.
#[derive(Debug, Error)]
pub enum IrError {
    /// A graph was traversed before its output node was set.
    #[error("graph {graph} has no output")]
    MissingOutput { graph: GraphId },

    /// The data-flow subgraph contains a cycle.
    #[error("data-flow cycle involving node {node}")]
    DataFlowCycle { node: NodeId },

    /// A node is referenced from a graph whose scope chain does not reach
    /// the node's owner.
    #[error("node {node} is referenced from graph {graph} but its owner is not an ancestor")]
    UnscopedReference { node: NodeId, graph: GraphId },

    /// The scope dependencies of a graph do not form a single ancestor
    /// chain.
    #[error("graph {graph} has ambiguous nesting: its scope dependencies are not a chain")]
    InconsistentNesting { graph: GraphId },
}
