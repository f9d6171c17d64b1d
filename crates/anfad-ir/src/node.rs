//! Node payloads for the ANF graph arena.
//!
//! A node is one of three kinds: a [`Parameter`](NodeKind::Parameter) of
//! its owning graph, a [`Constant`](NodeKind::Constant) holding an immutable
//! value (a literal, a primitive tag, or a graph reference -- graph
//! references are how closures become first-class data), or an
//! [`Apply`](NodeKind::Apply) whose input 0 is the called value and inputs
//! 1..n are its arguments.
//!
//! Every node also carries its *uses*: the set of `(user, index)` pairs
//! where it appears as an input. The use set is derived, maintained by the
//! [`Program`](crate::graph::Program) arena on apply construction and never
//! independently mutable -- it is the IR's fundamental data-flow query
//! ("who consumes this value, and where").

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::id::{GraphId, NodeId};
use crate::primitive::Primitive;

/// Input list of an apply node. Most applications are small (a callee plus
/// one or two arguments), so the list is inlined.
pub type InputList = SmallVec<[NodeId; 4]>;

/// An immutable value held by a constant node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    /// A floating-point literal.
    Float(f64),
    /// An integer literal (also used for projection indices).
    Int(i64),
    /// A boolean literal.
    Bool(bool),
    /// The empty tuple, the base of cons chains.
    Unit,
    /// A primitive operation tag.
    Prim(Primitive),
    /// A reference to a graph, materializing it as a first-class value.
    Graph(GraphId),
}

/// The kind of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A parameter of the owning graph; its position in the graph's
    /// parameter list is significant.
    Parameter,
    /// A constant value.
    Constant(ConstValue),
    /// An application: input 0 is the called value, inputs 1..n the
    /// arguments. Never empty.
    Apply(InputList),
}

/// A single use of a node: `user`'s input at `index` is this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Use {
    /// The consuming apply node.
    pub user: NodeId,
    /// The position in the user's input list.
    pub index: usize,
}

/// A node in the arena: its kind, its owner, and its derived use set.
///
/// Parameters and applies are always owned by exactly one graph; constants
/// are ownerless. The owner is set at creation and never reassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    /// What this node is.
    pub kind: NodeKind,
    /// The graph this node belongs to, if any.
    pub owner: Option<GraphId>,
    pub(crate) uses: IndexSet<Use>,
}

impl NodeData {
    pub(crate) fn new(kind: NodeKind, owner: Option<GraphId>) -> Self {
        NodeData {
            kind,
            owner,
            uses: IndexSet::new(),
        }
    }

    /// Returns `true` if this is an apply node.
    pub fn is_apply(&self) -> bool {
        matches!(self.kind, NodeKind::Apply(_))
    }

    /// Returns `true` if this is a constant of any kind.
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant(_))
    }

    /// Returns `true` if this is a constant holding a graph reference.
    pub fn is_constant_graph(&self) -> bool {
        matches!(self.kind, NodeKind::Constant(ConstValue::Graph(_)))
    }

    /// The graph held by this node, if it is a graph constant.
    pub fn held_graph(&self) -> Option<GraphId> {
        match self.kind {
            NodeKind::Constant(ConstValue::Graph(g)) => Some(g),
            _ => None,
        }
    }

    /// The input list, empty for non-apply nodes.
    pub fn inputs(&self) -> &[NodeId] {
        match &self.kind {
            NodeKind::Apply(inputs) => inputs,
            _ => &[],
        }
    }

    /// The `(user, index)` pairs where this node appears as an input, in
    /// registration order.
    pub fn uses(&self) -> &IndexSet<Use> {
        &self.uses
    }
}
