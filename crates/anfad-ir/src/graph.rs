//! The `Program` arena: every graph and node of one program.
//!
//! All construction goes through `Program` methods so the use back-index
//! stays consistent with apply input lists. The arena only ever grows:
//! transforms append derived graphs and nodes, they never mutate or delete
//! existing ones. Accessors taking an ID panic when handed a dangling
//! handle (the same contract as slice indexing); `try_`-variants return
//! `Option` instead.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::id::{GraphId, NodeId};
use crate::node::{ConstValue, InputList, NodeData, NodeKind, Use};
use crate::primitive::Primitive;
use crate::provenance::{GraphProvenance, NodeProvenance, ProvenanceTable, Role};

/// A graph: an ordered parameter list and a designated output node.
///
/// A graph owns every parameter and apply node created against it. Its
/// body -- the nodes reachable from the output -- may reference nodes
/// owned by other graphs; that is how closures are expressed structurally,
/// without explicit capture lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    pub(crate) parameters: Vec<NodeId>,
    pub(crate) output: Option<NodeId>,
    pub(crate) name: Option<String>,
}

impl GraphData {
    /// The graph's parameters, in declaration order.
    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    /// The designated output node, once set.
    pub fn output(&self) -> Option<NodeId> {
        self.output
    }

    /// Optional human-oriented name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// The arena owning all nodes and graphs of one program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    nodes: Vec<NodeData>,
    graphs: Vec<GraphData>,
    provenance: ProvenanceTable,
}

impl Program {
    /// Creates an empty program.
    pub fn new() -> Self {
        Program::default()
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Adds an empty, unnamed graph.
    pub fn add_graph(&mut self) -> GraphId {
        let id = GraphId(self.graphs.len() as u32);
        self.graphs.push(GraphData {
            parameters: Vec::new(),
            output: None,
            name: None,
        });
        id
    }

    /// Adds an empty graph with a name.
    pub fn add_named_graph(&mut self, name: impl Into<String>) -> GraphId {
        let id = self.add_graph();
        self.graphs[id.index()].name = Some(name.into());
        id
    }

    /// Appends a fresh parameter to `graph` and returns its node.
    pub fn parameter(&mut self, graph: GraphId) -> NodeId {
        let id = self.push_node(NodeData::new(NodeKind::Parameter, Some(graph)));
        self.graphs[graph.index()].parameters.push(id);
        id
    }

    /// Creates an ownerless constant node.
    pub fn constant(&mut self, value: ConstValue) -> NodeId {
        self.push_node(NodeData::new(NodeKind::Constant(value), None))
    }

    /// Convenience: a floating-point literal constant.
    pub fn float_constant(&mut self, value: f64) -> NodeId {
        self.constant(ConstValue::Float(value))
    }

    /// Convenience: an integer literal constant.
    pub fn int_constant(&mut self, value: i64) -> NodeId {
        self.constant(ConstValue::Int(value))
    }

    /// Convenience: a primitive-tag constant.
    pub fn prim_constant(&mut self, prim: Primitive) -> NodeId {
        self.constant(ConstValue::Prim(prim))
    }

    /// Convenience: a graph-reference constant, materializing `graph` as a
    /// first-class value.
    pub fn graph_constant(&mut self, graph: GraphId) -> NodeId {
        assert!(
            graph.index() < self.graphs.len(),
            "graph constant refers to unknown graph {graph}"
        );
        self.constant(ConstValue::Graph(graph))
    }

    /// Creates an apply node owned by `owner`. Input 0 is the called
    /// value, the rest are arguments; the use back-index of every input is
    /// updated.
    ///
    /// # Panics
    ///
    /// Panics if `inputs` is empty (there is always a callee) or if any ID
    /// is dangling.
    pub fn apply<I>(&mut self, owner: GraphId, inputs: I) -> NodeId
    where
        I: IntoIterator<Item = NodeId>,
    {
        let inputs: InputList = inputs.into_iter().collect();
        assert!(
            !inputs.is_empty(),
            "apply requires at least one input (the called value)"
        );
        assert!(
            owner.index() < self.graphs.len(),
            "apply owner {owner} is not a known graph"
        );
        let id = NodeId(self.nodes.len() as u32);
        for (index, &input) in inputs.iter().enumerate() {
            self.node_mut(input).uses.insert(Use { user: id, index });
        }
        self.nodes
            .push(NodeData::new(NodeKind::Apply(inputs), Some(owner)));
        id
    }

    /// Sets the designated output of `graph`.
    pub fn set_output(&mut self, graph: GraphId, node: NodeId) {
        assert!(
            node.index() < self.nodes.len(),
            "output node {node} is not a known node"
        );
        self.graphs[graph.index()].output = Some(node);
    }

    fn push_node(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(data);
        id
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The node for `id`. Panics on a dangling handle.
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.index()]
    }

    /// The node for `id`, or `None` if the handle is unknown.
    pub fn try_node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id.index())
    }

    /// The graph for `id`. Panics on a dangling handle.
    pub fn graph(&self, id: GraphId) -> &GraphData {
        &self.graphs[id.index()]
    }

    /// The graph for `id`, or `None` if the handle is unknown.
    pub fn try_graph(&self, id: GraphId) -> Option<&GraphData> {
        self.graphs.get(id.index())
    }

    /// The parameters of `graph`, in declaration order.
    pub fn parameters(&self, graph: GraphId) -> &[NodeId] {
        self.graph(graph).parameters()
    }

    /// The use set of `node`, in registration order.
    pub fn uses(&self, node: NodeId) -> &IndexSet<Use> {
        &self.node(node).uses
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of graphs in the arena.
    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    /// All graph IDs, in creation order.
    pub fn graph_ids(&self) -> impl Iterator<Item = GraphId> + '_ {
        (0..self.graphs.len()).map(|i| GraphId(i as u32))
    }

    // -----------------------------------------------------------------------
    // Provenance
    // -----------------------------------------------------------------------

    /// Records that `derived` was produced from `source` in `role`.
    pub fn record_node_provenance(&mut self, derived: NodeId, source: NodeId, role: Role) {
        self.provenance
            .nodes
            .insert(derived, NodeProvenance { source, role });
    }

    /// Records that `derived` was produced from `source` in `role`.
    pub fn record_graph_provenance(&mut self, derived: GraphId, source: GraphId, role: Role) {
        self.provenance
            .graphs
            .insert(derived, GraphProvenance { source, role });
    }

    /// Read-only access to the provenance side table.
    pub fn provenance(&self) -> &ProvenanceTable {
        &self.provenance
    }
}
