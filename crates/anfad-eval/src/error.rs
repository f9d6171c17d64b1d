//! Runtime errors.

use thiserror::Error;

use anfad_ir::{GraphId, IrError, NodeId, Primitive};

/// An error raised while evaluating a program.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("graph {graph} expects {expected} argument(s), got {got}")]
    ArityMismatch {
        graph: GraphId,
        expected: usize,
        got: usize,
    },

    #[error("primitive {prim} expects {expected} argument(s), got {got}")]
    PrimitiveArity {
        prim: Primitive,
        expected: usize,
        got: usize,
    },

    #[error("cannot call a value of type {what}")]
    NotCallable { what: &'static str },

    #[error("type error in {op}: unexpected {got}")]
    TypeMismatch { op: Primitive, got: &'static str },

    #[error("tuple index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("cannot lift a value of type {what}")]
    UnsupportedLift { what: &'static str },

    #[error("cannot unlift a value of type {what}")]
    UnsupportedUnlift { what: &'static str },

    #[error("parameter {node} has no binding")]
    UnboundParameter { node: NodeId },

    #[error("node {node} is not in scope from the current environment")]
    OutOfScope { node: NodeId },

    #[error("integer division by zero")]
    DivideByZero,

    #[error(transparent)]
    Ir(#[from] IrError),
}
