//! Nesting analysis: which graphs are reachable from a root, how they nest
//! lexically, and which foreign nodes each graph closes over.
//!
//! A graph depends on another graph when its live body either references a
//! node owned by it (a free variable) or embeds a constant that is
//! materialized inside it. The parent of a graph is its innermost
//! dependency; free variables are then propagated along parent chains so
//! that every graph between a reference and the owning scope knows it must
//! route the value through.
//!
//! The analysis is computed once, up front, over the live bodies only.
//! Nodes with no user path to a graph output never contribute a dependency.

use indexmap::{IndexMap, IndexSet};

use crate::error::IrError;
use crate::graph::Program;
use crate::id::{GraphId, NodeId};

/// Lexical-nesting facts for every graph reachable from a root.
#[derive(Debug, Clone)]
pub struct NestingAnalysis {
    root: GraphId,
    coverage: IndexSet<GraphId>,
    parents: IndexMap<GraphId, Option<GraphId>>,
    children: IndexMap<GraphId, Vec<GraphId>>,
    fvs_total: IndexMap<GraphId, IndexSet<NodeId>>,
}

impl NestingAnalysis {
    /// Runs the analysis from `root`.
    ///
    /// Fails with [`IrError::MissingOutput`] when a reachable graph has no
    /// output, [`IrError::UnscopedReference`] when a free variable's owner
    /// is not an ancestor of the referencing graph, and
    /// [`IrError::InconsistentNesting`] when no single innermost dependency
    /// exists.
    pub fn new(program: &Program, root: GraphId) -> Result<Self, IrError> {
        // Live-body scan: per graph, the foreign nodes it references and
        // the graphs it materializes through embedded constants.
        let mut coverage: IndexSet<GraphId> = IndexSet::new();
        let mut fvs_direct: IndexMap<GraphId, IndexSet<NodeId>> = IndexMap::new();
        let mut hard_deps: IndexMap<GraphId, IndexSet<GraphId>> = IndexMap::new();
        let mut soft_deps: IndexMap<GraphId, IndexSet<GraphId>> = IndexMap::new();

        let mut pending = vec![root];
        while let Some(graph) = pending.pop() {
            if !coverage.insert(graph) {
                continue;
            }
            fvs_direct.entry(graph).or_default();
            hard_deps.entry(graph).or_default();
            soft_deps.entry(graph).or_default();

            let output = program
                .graph(graph)
                .output()
                .ok_or(IrError::MissingOutput { graph })?;
            let mut seen: IndexSet<NodeId> = IndexSet::new();
            let mut stack = vec![output];
            while let Some(node) = stack.pop() {
                if !seen.insert(node) {
                    continue;
                }
                let data = program.node(node);
                match data.owner {
                    Some(owner) if owner != graph => {
                        // Free variable; its body is scanned as part of
                        // the owning graph, not here.
                        fvs_direct[&graph].insert(node);
                        hard_deps[&graph].insert(owner);
                    }
                    _ => {
                        for &input in data.inputs().iter().rev() {
                            stack.push(input);
                        }
                        if let Some(held) = data.held_graph() {
                            pending.push(held);
                            if held != graph {
                                soft_deps.entry(held).or_default().insert(graph);
                            }
                        }
                    }
                }
            }
        }

        // Transitive closures. A graph inherits the dependencies of every
        // graph it depends on, so the innermost dependency ends up with
        // the largest dependency set.
        let hard_total = transitive_closure(&coverage, |g| hard_deps[&g].iter().copied().collect());
        let mut deps = transitive_closure(&coverage, |g| {
            let mut seed: IndexSet<GraphId> = hard_deps[&g].iter().copied().collect();
            seed.extend(soft_deps.get(&g).into_iter().flatten().copied());
            seed
        });

        // Mutual dependencies arise from recursion through an ancestor
        // reference; keep the direction the free-variable chain dictates.
        let pairs: Vec<(GraphId, GraphId)> = coverage
            .iter()
            .flat_map(|&a| deps[&a].iter().map(move |&b| (a, b)))
            .filter(|&(a, b)| deps.get(&b).is_some_and(|d| d.contains(&a)))
            .collect();
        for (a, b) in pairs {
            let a_under_b = hard_total[&a].contains(&b);
            let b_under_a = hard_total.get(&b).is_some_and(|d| d.contains(&a));
            match (a_under_b, b_under_a) {
                (true, false) => {
                    deps[&b].shift_remove(&a);
                }
                (false, true) => {
                    deps[&a].shift_remove(&b);
                }
                _ => return Err(IrError::InconsistentNesting { graph: a }),
            }
        }

        // Parent = dependency with the most dependencies of its own.
        let mut parents: IndexMap<GraphId, Option<GraphId>> = IndexMap::new();
        for &graph in &coverage {
            let mut best: Option<GraphId> = None;
            for &dep in &deps[&graph] {
                match best {
                    None => best = Some(dep),
                    Some(cur) => {
                        let weight = |g: GraphId| deps.get(&g).map(IndexSet::len).unwrap_or(0);
                        let (a, b) = (weight(dep), weight(cur));
                        if a > b {
                            best = Some(dep);
                        } else if a == b {
                            return Err(IrError::InconsistentNesting { graph });
                        }
                    }
                }
            }
            parents.insert(graph, best);
        }

        let mut children: IndexMap<GraphId, Vec<GraphId>> = IndexMap::new();
        for &graph in &coverage {
            children.entry(graph).or_default();
        }
        for (&graph, &parent) in &parents {
            if let Some(parent) = parent {
                children.entry(parent).or_default().push(graph);
            }
        }

        // Propagate each free variable along the parent chain up to (but
        // excluding) its owning graph.
        let mut fvs_total: IndexMap<GraphId, IndexSet<NodeId>> = IndexMap::new();
        for &graph in &coverage {
            fvs_total.entry(graph).or_default();
        }
        for &graph in &coverage {
            for &node in &fvs_direct[&graph] {
                let owner = program
                    .node(node)
                    .owner
                    .unwrap_or_else(|| unreachable!("free variable {node} has no owner"));
                let mut at = graph;
                loop {
                    if at == owner {
                        break;
                    }
                    fvs_total[&at].insert(node);
                    match parents[&at] {
                        Some(up) => at = up,
                        None => return Err(IrError::UnscopedReference { node, graph }),
                    }
                }
            }
        }

        Ok(Self {
            root,
            coverage,
            parents,
            children,
            fvs_total,
        })
    }

    /// The root graph the analysis started from.
    pub fn root(&self) -> GraphId {
        self.root
    }

    /// Every graph reachable from the root, in discovery order.
    pub fn coverage(&self) -> &IndexSet<GraphId> {
        &self.coverage
    }

    /// The innermost graph `graph` depends on, or `None` for a graph that
    /// closes over nothing.
    pub fn parent(&self, graph: GraphId) -> Option<GraphId> {
        self.parents.get(&graph).copied().flatten()
    }

    /// Graphs whose parent is `graph`.
    pub fn children(&self, graph: GraphId) -> &[GraphId] {
        self.children.get(&graph).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Free variables of `graph`, including those routed through it on
    /// behalf of nested graphs, in a deterministic order.
    ///
    /// # Panics
    ///
    /// Panics if `graph` is outside the coverage.
    pub fn free_variables_total(&self, graph: GraphId) -> &IndexSet<NodeId> {
        self.fvs_total
            .get(&graph)
            .unwrap_or_else(|| panic!("graph {graph} is outside the analysis coverage"))
    }
}

fn transitive_closure<F>(coverage: &IndexSet<GraphId>, seed: F) -> IndexMap<GraphId, IndexSet<GraphId>>
where
    F: Fn(GraphId) -> IndexSet<GraphId>,
{
    let mut deps: IndexMap<GraphId, IndexSet<GraphId>> = coverage
        .iter()
        .map(|&g| {
            let mut set = seed(g);
            set.shift_remove(&g);
            (g, set)
        })
        .collect();
    loop {
        let mut changed = false;
        for &graph in coverage {
            let mut gained: IndexSet<GraphId> = IndexSet::new();
            for &dep in &deps[&graph] {
                if let Some(inner) = deps.get(&dep) {
                    gained.extend(inner.iter().copied());
                }
            }
            gained.shift_remove(&graph);
            for item in gained {
                if deps[&graph].insert(item) {
                    changed = true;
                }
            }
        }
        if !changed {
            return deps;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Primitive;

    fn two_level(p: &mut Program) -> (GraphId, GraphId, NodeId) {
        // outer(d) = inner(3)  where  inner(y) = y * d
        let outer = p.add_named_graph("outer");
        let d = p.parameter(outer);

        let inner = p.add_named_graph("inner");
        let y = p.parameter(inner);
        let mul = p.prim_constant(Primitive::Mul);
        let body = p.apply(inner, [mul, y, d]);
        p.set_output(inner, body);

        let inner_ref = p.graph_constant(inner);
        let three = p.int_constant(3);
        let call = p.apply(outer, [inner_ref, three]);
        p.set_output(outer, call);
        (outer, inner, d)
    }

    #[test]
    fn direct_capture_nests_under_owner() {
        let mut p = Program::new();
        let (outer, inner, d) = two_level(&mut p);

        let nest = NestingAnalysis::new(&p, outer).unwrap();
        assert_eq!(nest.coverage().len(), 2);
        assert_eq!(nest.parent(inner), Some(outer));
        assert_eq!(nest.parent(outer), None);
        assert_eq!(nest.children(outer), [inner]);
        assert!(nest.free_variables_total(inner).contains(&d));
        assert!(nest.free_variables_total(outer).is_empty());
    }

    #[test]
    fn capture_routes_through_materializing_graph() {
        // outer(d) = mid()  where  mid() = leaf(4)  and  leaf(y) = y * d.
        // leaf is materialized inside mid, so d must travel through mid even
        // though mid never touches d itself.
        let mut p = Program::new();
        let outer = p.add_named_graph("outer");
        let d = p.parameter(outer);

        let leaf = p.add_named_graph("leaf");
        let y = p.parameter(leaf);
        let mul = p.prim_constant(Primitive::Mul);
        let body = p.apply(leaf, [mul, y, d]);
        p.set_output(leaf, body);

        let mid = p.add_named_graph("mid");
        let leaf_ref = p.graph_constant(leaf);
        let four = p.int_constant(4);
        let mid_out = p.apply(mid, [leaf_ref, four]);
        p.set_output(mid, mid_out);

        let mid_ref = p.graph_constant(mid);
        let outer_out = p.apply(outer, [mid_ref]);
        p.set_output(outer, outer_out);

        let nest = NestingAnalysis::new(&p, outer).unwrap();
        assert_eq!(nest.parent(leaf), Some(mid));
        assert_eq!(nest.parent(mid), Some(outer));
        assert!(nest.free_variables_total(leaf).contains(&d));
        assert!(nest.free_variables_total(mid).contains(&d));
        assert!(nest.free_variables_total(outer).is_empty());
    }

    #[test]
    fn dead_references_do_not_create_dependencies() {
        let mut p = Program::new();
        let outer = p.add_named_graph("outer");
        let d = p.parameter(outer);

        let inner = p.add_named_graph("inner");
        let y = p.parameter(inner);
        let mul = p.prim_constant(Primitive::Mul);
        // Dead: references d but is not reachable from inner's output.
        let _dead = p.apply(inner, [mul, y, d]);
        let live = p.apply(inner, [mul, y, y]);
        p.set_output(inner, live);

        let inner_ref = p.graph_constant(inner);
        let three = p.int_constant(3);
        let call = p.apply(outer, [inner_ref, three]);
        p.set_output(outer, call);

        let nest = NestingAnalysis::new(&p, outer).unwrap();
        assert_eq!(nest.parent(inner), Some(outer));
        assert!(!nest.free_variables_total(inner).contains(&d));
    }

    #[test]
    fn missing_output_is_reported() {
        let mut p = Program::new();
        let g = p.add_graph();
        let err = NestingAnalysis::new(&p, g).unwrap_err();
        assert!(matches!(err, IrError::MissingOutput { graph } if graph == g));
    }

    #[test]
    fn ambiguous_nesting_is_rejected() {
        // g captures from two unrelated graphs; neither encloses the other,
        // so no single parent exists.
        let mut p = Program::new();
        let a = p.add_named_graph("a");
        let pa = p.parameter(a);
        let b = p.add_named_graph("b");
        let pb = p.parameter(b);

        let g = p.add_named_graph("g");
        let add = p.prim_constant(Primitive::Add);
        let sum = p.apply(g, [add, pa, pb]);
        p.set_output(g, sum);

        // Make everything reachable from one root without nesting a or b.
        let root = p.add_named_graph("root");
        let g_ref = p.graph_constant(g);
        let a_ref = p.graph_constant(a);
        let b_ref = p.graph_constant(b);
        let one = p.int_constant(1);
        let ca = p.apply(root, [a_ref, one]);
        p.set_output(a, pa);
        p.set_output(b, pb);
        let cb = p.apply(root, [b_ref, ca]);
        let cg = p.apply(root, [g_ref, cb]);
        p.set_output(root, cg);

        let err = NestingAnalysis::new(&p, root).unwrap_err();
        assert!(matches!(err, IrError::InconsistentNesting { .. }));
    }
}
