//! Plain-text rendering of graphs, for logs and test diagnostics.

use std::fmt::Write;

use crate::error::IrError;
use crate::graph::Program;
use crate::id::GraphId;
use crate::node::{ConstValue, NodeKind};
use crate::traverse::toposort;

/// Renders `graph` as one line per live node, inputs before users.
///
/// ```text
/// graph @0 fwd_main(%0, %1):
///   %4 = %3(%0, %1)
///   output %4
/// ```
pub fn graph_to_string(program: &Program, graph: GraphId) -> Result<String, IrError> {
    let data = program.graph(graph);
    let mut out = String::new();

    write!(out, "graph {graph}").ok();
    if let Some(name) = data.name() {
        write!(out, " {name}").ok();
    }
    out.push('(');
    for (i, param) in data.parameters().iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write!(out, "{param}").ok();
    }
    out.push_str("):\n");

    let output = data.output().ok_or(IrError::MissingOutput { graph })?;
    for node in toposort(program, output)? {
        match &program.node(node).kind {
            NodeKind::Parameter => {}
            NodeKind::Constant(value) => {
                writeln!(out, "  {node} = const {}", render_const(value)).ok();
            }
            NodeKind::Apply(inputs) => {
                let (callee, args) = inputs.split_first().unwrap_or_else(|| {
                    unreachable!("apply {node} has no inputs")
                });
                write!(out, "  {node} = {callee}(").ok();
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "{arg}").ok();
                }
                out.push_str(")\n");
            }
        }
    }
    writeln!(out, "  output {output}").ok();
    Ok(out)
}

fn render_const(value: &ConstValue) -> String {
    match value {
        ConstValue::Float(v) => format!("{v}"),
        ConstValue::Int(v) => format!("{v}"),
        ConstValue::Bool(v) => format!("{v}"),
        ConstValue::Unit => "()".to_string(),
        ConstValue::Prim(prim) => prim.name().to_string(),
        ConstValue::Graph(graph) => format!("{graph}"),
    }
}
