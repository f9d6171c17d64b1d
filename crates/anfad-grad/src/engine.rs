//! Graph-to-graph reverse-mode differentiation.
//!
//! [`Grad::process_graph`] takes a source graph `g` and synthesizes two new
//! graphs in the same program:
//!
//! * a forward graph `↑g` that computes the same result as `g` but returns
//!   a pair `(tagged result, backpropagator closure)`, with every call
//!   inside it rewritten to the forward form of its callee and every leaf
//!   constant passed through `lift`;
//! * a backpropagator graph `♢g` that takes the output sensitivity and
//!   returns a tuple `((∇fv..), ∇p1, .., ∇pm)`: first the sensitivities of
//!   the free variables `g` closes over, then one sensitivity per source
//!   parameter.
//!
//! The engine never rewrites the source graphs. All bookkeeping lives in
//! memo tables keyed by source IDs, and the relation between source and
//! derived nodes is recorded in the program's provenance table. Memo tables
//! persist across calls, so differentiating a second root reuses everything
//! already built.
//!
//! Both passes run as a worklist fixpoint with explicit stacks; recursion
//! depth never depends on graph size. Because every derived node is keyed
//! by the source node it answers for, the emitted structure does not depend
//! on the order in which demands arrive.

use std::collections::VecDeque;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use anfad_ir::{
    ConstValue, GraphId, IrError, NestingAnalysis, NodeId, NodeKind, Primitive, Program, Role,
};

/// Reverse-mode differentiation engine. One instance accumulates derived
/// graphs for any number of roots over a single [`Program`].
#[derive(Debug, Default)]
pub struct Grad {
    todo_fw: VecDeque<GraphId>,
    done_fw: IndexSet<GraphId>,
    todo_bw: IndexSet<GraphId>,

    /// Free-variable order frozen per graph at scaffold time; the fv tuple
    /// in `♢g`'s output follows this order.
    fv_order: IndexMap<GraphId, Vec<NodeId>>,

    forward: IndexMap<GraphId, GraphId>,
    backprop: IndexMap<GraphId, GraphId>,

    /// Source node -> its value in the forward world. Plain constants are
    /// absent here; they live in `lifted`, keyed per demanding graph.
    tagged: IndexMap<NodeId, NodeId>,
    /// (ownerless constant, forward graph) -> the lift application built
    /// for it in that graph. A constant may be shared by several source
    /// graphs, and its lift must be owned by each forward graph that
    /// references it.
    lifted: IndexMap<(NodeId, GraphId), NodeId>,
    /// Source node -> the node holding its backpropagator, `None` for
    /// parameters and constants (they carry no call to unwind).
    bprop_value: IndexMap<NodeId, Option<NodeId>>,
    /// (source node, graph it is viewed from) -> accumulated sensitivity.
    sensitivity: IndexMap<(NodeId, GraphId), NodeId>,
    /// Live apply -> the applied-backpropagator node shared by all of its
    /// input positions.
    step: IndexMap<NodeId, NodeId>,

    /// Graph -> the constants that materialize it as a value.
    closure_sites: IndexMap<GraphId, IndexSet<NodeId>>,
    /// (graph, node) -> the children of `graph` that close over `node`.
    children_with_fv: IndexMap<(GraphId, NodeId), Vec<GraphId>>,

    nesting: Option<NestingAnalysis>,
}

enum TagStep {
    /// Visit a source node; the graph is the forward graph that ownerless
    /// constants reached from here are lifted into.
    Enter(NodeId, GraphId),
    Build(NodeId),
}

enum SensStep {
    Enter(NodeId),
    Build(NodeId),
}

impl Grad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Differentiates `root`, returning its forward graph. `root` must be
    /// closed: a root that references nodes owned by a graph outside its
    /// own reach has no scope to route those sensitivities through.
    pub fn process_graph(
        &mut self,
        program: &mut Program,
        root: GraphId,
    ) -> Result<GraphId, IrError> {
        if let Some(&fg) = self.forward.get(&root) {
            return Ok(fg);
        }

        let nesting = NestingAnalysis::new(program, root)?;
        if let Some(&node) = nesting.free_variables_total(root).first() {
            return Err(IrError::UnscopedReference { node, graph: root });
        }
        debug!(
            root = %root,
            graphs = nesting.coverage().len(),
            "differentiating"
        );

        for &graph in nesting.coverage() {
            for &child in nesting.children(graph) {
                for &fv in nesting.free_variables_total(child) {
                    let routed = self.children_with_fv.entry((graph, fv)).or_default();
                    if !routed.contains(&child) {
                        routed.push(child);
                    }
                }
            }
        }
        self.nesting = Some(nesting);

        self.scaffold(program, root)?;
        while let Some(graph) = self.todo_fw.pop_front() {
            if self.done_fw.contains(&graph) {
                continue;
            }
            self.forward_phase(program, graph)?;
        }

        let pending: Vec<GraphId> = self.todo_bw.drain(..).collect();
        for graph in pending {
            self.backward_phase(program, graph)?;
        }

        Ok(self.forward[&root])
    }

    /// The forward graph derived for `graph`, if it has been processed.
    pub fn forward_graph(&self, graph: GraphId) -> Option<GraphId> {
        self.forward.get(&graph).copied()
    }

    /// The backpropagator graph derived for `graph`, if it has been
    /// processed.
    pub fn backprop_graph(&self, graph: GraphId) -> Option<GraphId> {
        self.backprop.get(&graph).copied()
    }

    /// The free-variable order underlying the fv tuple of `♢graph`.
    pub fn fv_order(&self, graph: GraphId) -> Option<&[NodeId]> {
        self.fv_order.get(&graph).map(Vec::as_slice)
    }

    // -----------------------------------------------------------------------
    // Scaffolding
    // -----------------------------------------------------------------------

    /// Creates the empty `↑g` and `♢g` shells for `graph`: forward
    /// parameters mirroring the source parameters, the backpropagator's
    /// single sensitivity parameter, and the frozen fv order. Bodies are
    /// filled in by the two phases.
    fn scaffold(&mut self, program: &mut Program, graph: GraphId) -> Result<(), IrError> {
        if self.forward.contains_key(&graph) {
            return Ok(());
        }
        let output = program
            .graph(graph)
            .output()
            .ok_or(IrError::MissingOutput { graph })?;

        let nesting = self
            .nesting
            .as_ref()
            .unwrap_or_else(|| unreachable!("scaffold before nesting analysis"));
        let order: Vec<NodeId> = nesting.free_variables_total(graph).iter().copied().collect();
        self.fv_order.insert(graph, order);

        let base = program
            .graph(graph)
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{graph}"));

        let fg = program.add_named_graph(format!("fwd_{base}"));
        program.record_graph_provenance(fg, graph, Role::ForwardGraph);
        for &param in program.parameters(graph).to_vec().iter() {
            let fparam = program.parameter(fg);
            program.record_node_provenance(fparam, param, Role::Tagged);
            self.tagged.insert(param, fparam);
            self.bprop_value.insert(param, None);
        }

        let bg = program.add_named_graph(format!("bprop_{base}"));
        program.record_graph_provenance(bg, graph, Role::BackpropGraph);
        let bparam = program.parameter(bg);
        program.record_node_provenance(bparam, output, Role::Sensitivity);
        self.sensitivity.insert((output, graph), bparam);

        debug!(source = %graph, forward = %fg, backprop = %bg, "scaffolded");
        self.forward.insert(graph, fg);
        self.backprop.insert(graph, bg);
        self.closure_sites.entry(graph).or_default();
        self.todo_fw.push_back(graph);
        self.todo_bw.insert(graph);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Forward phase
    // -----------------------------------------------------------------------

    /// Populates `↑g`: tags the source output, then emits the output pair
    /// `(tagged output, ♢g)`.
    fn forward_phase(&mut self, program: &mut Program, graph: GraphId) -> Result<(), IrError> {
        let fg = self.forward[&graph];
        let bg = self.backprop[&graph];
        let output = program
            .graph(graph)
            .output()
            .ok_or(IrError::MissingOutput { graph })?;

        let tagged_out = self.tag(program, output, fg)?;
        let bg_const = program.graph_constant(bg);
        let pair = make_cons(program, fg, &[tagged_out, bg_const]);
        program.set_output(fg, pair);
        self.done_fw.insert(graph);
        debug!(source = %graph, forward = %fg, "forward phase done");
        Ok(())
    }

    /// Returns the forward-world value of `node`, building it on demand.
    ///
    /// * applies become applies of tagged inputs, split into a tagged value
    ///   (item 0) and a backpropagator (item 1);
    /// * graph constants become constants of the callee's forward graph and
    ///   are remembered as closure sites;
    /// * other constants are passed through `lift`, one lift application
    ///   per forward graph that references them.
    fn tag(
        &mut self,
        program: &mut Program,
        node: NodeId,
        context: GraphId,
    ) -> Result<NodeId, IrError> {
        let mut stack = vec![TagStep::Enter(node, context)];
        while let Some(step) = stack.pop() {
            match step {
                TagStep::Enter(n, ctx) => {
                    match program.node(n).kind.clone() {
                        NodeKind::Constant(ConstValue::Graph(held)) => {
                            if self.tagged.contains_key(&n) {
                                continue;
                            }
                            self.scaffold(program, held)?;
                            self.closure_sites[&held].insert(n);
                            let t = program.graph_constant(self.forward[&held]);
                            program.record_node_provenance(t, n, Role::Tagged);
                            self.tagged.insert(n, t);
                            self.bprop_value.insert(n, None);
                        }
                        NodeKind::Constant(_) => {
                            if self.lifted.contains_key(&(n, ctx)) {
                                continue;
                            }
                            let lift = program.prim_constant(Primitive::Lift);
                            let t = program.apply(ctx, [lift, n]);
                            program.record_node_provenance(t, n, Role::Tagged);
                            self.lifted.insert((n, ctx), t);
                            self.bprop_value.insert(n, None);
                        }
                        NodeKind::Parameter => {
                            if self.tagged.contains_key(&n) {
                                continue;
                            }
                            // Scaffolding seeds every parameter of a graph,
                            // so an untagged one means the owner was never
                            // scaffolded.
                            let owner = program.node(n).owner.unwrap_or_else(|| {
                                unreachable!("parameter {n} has no owner")
                            });
                            self.scaffold(program, owner)?;
                            assert!(
                                self.tagged.contains_key(&n),
                                "parameter {n} missing after scaffolding {owner}"
                            );
                        }
                        NodeKind::Apply(inputs) => {
                            if self.tagged.contains_key(&n) {
                                continue;
                            }
                            let owner = program.node(n).owner.unwrap_or_else(|| {
                                unreachable!("apply {n} has no owner")
                            });
                            let fw = *self.forward.get(&owner).unwrap_or_else(|| {
                                panic!("graph {owner} was never scaffolded; is the root closed?")
                            });
                            stack.push(TagStep::Build(n));
                            for &input in inputs.iter().rev() {
                                if self.tagged_in(input, fw).is_none() {
                                    stack.push(TagStep::Enter(input, fw));
                                }
                            }
                        }
                    }
                }
                TagStep::Build(n) => {
                    if self.tagged.contains_key(&n) {
                        continue;
                    }
                    let owner = program
                        .node(n)
                        .owner
                        .unwrap_or_else(|| unreachable!("apply {n} has no owner"));
                    let fw = self.forward[&owner];
                    let inputs = match &program.node(n).kind {
                        NodeKind::Apply(inputs) => inputs.clone(),
                        _ => unreachable!("build step on non-apply {n}"),
                    };
                    let tagged_inputs: Vec<NodeId> = inputs
                        .iter()
                        .map(|&input| {
                            self.tagged_in(input, fw).unwrap_or_else(|| {
                                unreachable!("input {input} untagged at build time")
                            })
                        })
                        .collect();
                    let app = program.apply(fw, tagged_inputs);
                    let t = index_apply(program, fw, app, 0);
                    let b = index_apply(program, fw, app, 1);
                    program.record_node_provenance(t, n, Role::Tagged);
                    program.record_node_provenance(b, n, Role::BackpropValue);
                    self.tagged.insert(n, t);
                    self.bprop_value.insert(n, Some(b));
                }
            }
        }
        Ok(self
            .tagged_in(node, context)
            .unwrap_or_else(|| unreachable!("{node} untagged after forward walk")))
    }

    /// The forward-world value of `node` as referenced from the forward
    /// graph `fw`: the shared tagged form for owned nodes and graph
    /// constants, the per-graph lift for plain constants.
    fn tagged_in(&self, node: NodeId, fw: GraphId) -> Option<NodeId> {
        self.tagged
            .get(&node)
            .or_else(|| self.lifted.get(&(node, fw)))
            .copied()
    }

    // -----------------------------------------------------------------------
    // Backward phase
    // -----------------------------------------------------------------------

    /// Populates `♢g`: computes the sensitivity of every free variable and
    /// every parameter, then emits the output tuple
    /// `((∇fv..), ∇p1, .., ∇pm)`.
    fn backward_phase(&mut self, program: &mut Program, graph: GraphId) -> Result<(), IrError> {
        let bg = self.backprop[&graph];

        let fvs = self.fv_order[&graph].clone();
        let mut fv_sens = Vec::with_capacity(fvs.len());
        for fv in fvs {
            fv_sens.push(self.sensitivity(program, fv, graph)?);
        }
        let fv_tuple = make_cons(program, bg, &fv_sens);

        let params = program.parameters(graph).to_vec();
        let mut elems = Vec::with_capacity(params.len() + 1);
        elems.push(fv_tuple);
        for param in params {
            elems.push(self.sensitivity(program, param, graph)?);
        }
        let out = make_cons(program, bg, &elems);
        program.set_output(bg, out);
        debug!(source = %graph, backprop = %bg, "backward phase done");
        Ok(())
    }

    /// Returns the accumulated sensitivity of `node` as seen from `graph`,
    /// building it on demand in `♢graph`.
    ///
    /// Contributions come from two places: every live apply in `graph` that
    /// consumes the node (one slot of that apply's unwound backpropagator),
    /// and every child graph that closes over it (one slot of the fv tuple
    /// flowing out of the child's closure site). A node with no
    /// contributions gets `zeros_like` of its tagged value. Applies that no
    /// output depends on were never tagged and contribute nothing.
    fn sensitivity(
        &mut self,
        program: &mut Program,
        node: NodeId,
        graph: GraphId,
    ) -> Result<NodeId, IrError> {
        let bg = self.backprop[&graph];
        let mut in_progress: IndexSet<NodeId> = IndexSet::new();
        let mut stack = vec![SensStep::Enter(node)];
        while let Some(step) = stack.pop() {
            match step {
                SensStep::Enter(n) => {
                    if self.sensitivity.contains_key(&(n, graph)) || !in_progress.insert(n) {
                        continue;
                    }
                    stack.push(SensStep::Build(n));
                    for (user, _) in self.live_users(program, n, graph) {
                        if !self.sensitivity.contains_key(&(user, graph)) {
                            stack.push(SensStep::Enter(user));
                        }
                    }
                    for (_, site) in self.routed_sites(n, graph) {
                        if !self.sensitivity.contains_key(&(site, graph)) {
                            stack.push(SensStep::Enter(site));
                        }
                    }
                }
                SensStep::Build(n) => {
                    if self.sensitivity.contains_key(&(n, graph)) {
                        continue;
                    }
                    let mut contribs = Vec::new();
                    for (user, index) in self.live_users(program, n, graph) {
                        let step_node = self.bprop_step(program, user, graph)?;
                        contribs.push(index_apply(program, bg, step_node, index));
                    }
                    for (child, site) in self.routed_sites(n, graph) {
                        let fv_index = self.fv_order[&child]
                            .iter()
                            .position(|&fv| fv == n)
                            .unwrap_or_else(|| {
                                unreachable!("{n} routed through {child} but not in its fv order")
                            });
                        let site_sens = *self
                            .sensitivity
                            .get(&(site, graph))
                            .ok_or(IrError::DataFlowCycle { node: site })?;
                        contribs.push(index_apply(program, bg, site_sens, fv_index));
                    }

                    let sens = match contribs.split_first() {
                        None => {
                            let zeros = program.prim_constant(Primitive::ZerosLike);
                            let tagged = self.tagged[&n];
                            program.apply(bg, [zeros, tagged])
                        }
                        Some((&first, rest)) => {
                            let mut acc = first;
                            for &contrib in rest {
                                let add = program.prim_constant(Primitive::Add);
                                acc = program.apply(bg, [add, acc, contrib]);
                            }
                            acc
                        }
                    };
                    program.record_node_provenance(sens, n, Role::Sensitivity);
                    self.sensitivity.insert((n, graph), sens);
                }
            }
        }
        self.sensitivity
            .get(&(node, graph))
            .copied()
            .ok_or(IrError::DataFlowCycle { node })
    }

    /// Applies in `graph` that consume `node` and were reached by the
    /// forward phase, with the input position they consume it at.
    fn live_users(&self, program: &Program, node: NodeId, graph: GraphId) -> Vec<(NodeId, usize)> {
        program
            .uses(node)
            .iter()
            .filter(|u| program.node(u.user).owner == Some(graph))
            .filter(|u| matches!(self.bprop_value.get(&u.user), Some(Some(_))))
            .map(|u| (u.user, u.index))
            .collect()
    }

    /// Closure sites through which `node` flows into child graphs of
    /// `graph`, paired with the child they materialize.
    fn routed_sites(&self, node: NodeId, graph: GraphId) -> Vec<(GraphId, NodeId)> {
        let mut out = Vec::new();
        if let Some(children) = self.children_with_fv.get(&(graph, node)) {
            for &child in children {
                if let Some(sites) = self.closure_sites.get(&child) {
                    out.extend(sites.iter().map(|&site| (child, site)));
                }
            }
        }
        out
    }

    /// The unwound backpropagator of a live apply: its backpropagator value
    /// applied to its own sensitivity. Shared across all input positions of
    /// the apply.
    fn bprop_step(
        &mut self,
        program: &mut Program,
        user: NodeId,
        graph: GraphId,
    ) -> Result<NodeId, IrError> {
        if let Some(&node) = self.step.get(&user) {
            return Ok(node);
        }
        let bg = self.backprop[&graph];
        let bprop = self
            .bprop_value
            .get(&user)
            .copied()
            .flatten()
            .unwrap_or_else(|| unreachable!("live apply {user} has no backpropagator"));
        let sens = *self
            .sensitivity
            .get(&(user, graph))
            .ok_or(IrError::DataFlowCycle { node: user })?;
        let node = program.apply(bg, [bprop, sens]);
        self.step.insert(user, node);
        Ok(node)
    }
}

/// Builds `GetItem(value, index)` in `graph`.
fn index_apply(program: &mut Program, graph: GraphId, value: NodeId, index: usize) -> NodeId {
    let get = program.prim_constant(Primitive::GetItem);
    let idx = program.int_constant(index as i64);
    program.apply(graph, [get, value, idx])
}

/// Builds a right-nested cons chain evaluating to the tuple of `elems`.
fn make_cons(program: &mut Program, graph: GraphId, elems: &[NodeId]) -> NodeId {
    let mut acc = program.constant(ConstValue::Unit);
    for &elem in elems.iter().rev() {
        let cons = program.prim_constant(Primitive::ConsTuple);
        acc = program.apply(graph, [cons, elem, acc]);
    }
    acc
}
