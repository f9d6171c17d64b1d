//! Runtime values.

use anfad_ir::{GraphId, Primitive};

use crate::env::Env;

/// A value produced by evaluation.
///
/// Besides the obvious scalars and tuples, three shapes exist purely for
/// differentiation: a lifted primitive (behaves like the primitive but also
/// returns its backpropagator), a primitive backpropagator closed over the
/// call's arguments, and the polymorphic additive identity [`Value::Zero`]
/// that stands in for "no gradient" on values with no numeric shape.
#[derive(Debug, Clone)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    Tuple(Vec<Value>),
    /// A primitive as a first-class value.
    Prim(Primitive),
    /// A graph paired with the environment it was materialized in.
    Closure { graph: GraphId, env: Env },
    /// A primitive in the forward world: applying it yields
    /// `(result, backpropagator)`.
    LiftedPrim(Primitive),
    /// The backpropagator of one primitive application.
    PrimBprop { prim: Primitive, args: Vec<Value> },
    /// Additive identity absorbed by `add` and projection.
    Zero,
}

impl Value {
    /// Short name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Float(_) => "float",
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Tuple(_) => "tuple",
            Value::Prim(_) => "primitive",
            Value::Closure { .. } => "closure",
            Value::LiftedPrim(_) => "lifted primitive",
            Value::PrimBprop { .. } => "backpropagator",
            Value::Zero => "zero",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Prim(a), Value::Prim(b)) => a == b,
            (
                Value::Closure { graph: ga, env: ea },
                Value::Closure { graph: gb, env: eb },
            ) => ga == gb && std::rc::Rc::ptr_eq(ea, eb),
            (Value::LiftedPrim(a), Value::LiftedPrim(b)) => a == b,
            (
                Value::PrimBprop { prim: pa, args: aa },
                Value::PrimBprop { prim: pb, args: ab },
            ) => pa == pb && aa == ab,
            (Value::Zero, Value::Zero) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Frame;

    #[test]
    fn closures_compare_by_identity() {
        let e1 = Frame::root();
        let e2 = Frame::root();
        let a = Value::Closure { graph: GraphId(0), env: e1.clone() };
        let b = Value::Closure { graph: GraphId(0), env: e1 };
        let c = Value::Closure { graph: GraphId(0), env: e2 };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_is_only_equal_to_itself() {
        assert_eq!(Value::Zero, Value::Zero);
        assert_ne!(Value::Zero, Value::Float(0.0));
        assert_ne!(Value::Zero, Value::Tuple(vec![]));
    }
}
