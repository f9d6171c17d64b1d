//! Graph traversal utilities: depth-first walks, topological ordering, and
//! reachable-graph discovery.
//!
//! These are pure reading functions over a [`Program`]; they never mutate
//! the arena. Traversal follows apply *inputs* (the incoming direction of
//! data flow), optionally crossing into the bodies of graphs held by
//! constants.

use indexmap::IndexSet;

use crate::error::IrError;
use crate::graph::Program;
use crate::id::{GraphId, NodeId};

/// Depth-first preorder over `start` and everything reachable through
/// inputs. With `follow_graphs`, a constant holding a graph also descends
/// into that graph's output (when set).
pub fn dfs(program: &Program, start: NodeId, follow_graphs: bool) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut seen: IndexSet<NodeId> = IndexSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        order.push(node);
        let data = program.node(node);
        for &input in data.inputs().iter().rev() {
            stack.push(input);
        }
        if follow_graphs {
            if let Some(held) = data.held_graph() {
                if let Some(output) = program.graph(held).output() {
                    stack.push(output);
                }
            }
        }
    }
    order
}

/// Topological order of the nodes reachable from `start` through inputs:
/// every node appears after all of its inputs. Graph references are not
/// followed (a graph may legitimately reference itself or an ancestor
/// through constants; only the data-flow subgraph must be acyclic).
pub fn toposort(program: &Program, start: NodeId) -> Result<Vec<NodeId>, IrError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: indexmap::IndexMap<NodeId, Mark> = indexmap::IndexMap::new();
    let mut order = Vec::new();
    // Two-phase stack: Enter expands inputs, Exit emits the node.
    enum Step {
        Enter(NodeId),
        Exit(NodeId),
    }
    let mut stack = vec![Step::Enter(start)];
    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(node) => match marks.get(&node) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    return Err(IrError::DataFlowCycle { node });
                }
                None => {
                    marks.insert(node, Mark::InProgress);
                    stack.push(Step::Exit(node));
                    for &input in program.node(node).inputs().iter().rev() {
                        stack.push(Step::Enter(input));
                    }
                }
            },
            Step::Exit(node) => {
                marks.insert(node, Mark::Done);
                order.push(node);
            }
        }
    }
    Ok(order)
}

/// All graphs reachable from `root` by following graph constants embedded
/// in graph bodies, inclusive of `root`, in discovery order.
pub fn reachable_graphs(program: &Program, root: GraphId) -> Result<IndexSet<GraphId>, IrError> {
    let mut coverage: IndexSet<GraphId> = IndexSet::new();
    let mut pending = vec![root];
    while let Some(graph) = pending.pop() {
        if !coverage.insert(graph) {
            continue;
        }
        let output = program
            .graph(graph)
            .output()
            .ok_or(IrError::MissingOutput { graph })?;
        for node in dfs(program, output, false) {
            if let Some(held) = program.node(node).held_graph() {
                pending.push(held);
            }
        }
    }
    Ok(coverage)
}
