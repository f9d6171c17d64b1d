//! The closed set of primitive operation tags.
//!
//! Primitives are *tags*, not behavior: the IR and the gradient transform
//! only ever reference them through [`Constant`](crate::node::ConstValue)
//! nodes, and a downstream evaluator gives them meaning. The set is closed;
//! no extension point is provided.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A primitive operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Primitive {
    /// Binary addition. Also the operator used to sum gradient
    /// contributions, so an evaluator must fold the additive-identity null
    /// and add tuples element-wise.
    Add,
    /// Binary subtraction.
    Sub,
    /// Binary multiplication.
    Mul,
    /// Binary division.
    Div,
    /// Unary negation.
    Neg,
    /// Variadic tuple construction.
    MakeTuple,
    /// Prepend an element to a tuple: `cons(x, (a, b))` is `(x, a, b)`.
    ConsTuple,
    /// Positional projection out of a tuple.
    GetItem,
    /// Map a value into the differentiable representation: identity on
    /// numeric literals, registry lookup on primitive tags, gradient
    /// transform on graphs.
    Lift,
    /// Partial left inverse of `Lift`, defined on numeric literals only.
    Unlift,
    /// Construct the additive identity matching a value's structure.
    ZerosLike,
}

impl Primitive {
    /// Stable lowercase name, used by the printer and in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Add => "add",
            Primitive::Sub => "sub",
            Primitive::Mul => "mul",
            Primitive::Div => "div",
            Primitive::Neg => "neg",
            Primitive::MakeTuple => "make_tuple",
            Primitive::ConsTuple => "cons_tuple",
            Primitive::GetItem => "getitem",
            Primitive::Lift => "lift",
            Primitive::Unlift => "unlift",
            Primitive::ZerosLike => "zeros_like",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(Primitive::Add.name(), "add");
        assert_eq!(Primitive::ConsTuple.name(), "cons_tuple");
        assert_eq!(format!("{}", Primitive::ZerosLike), "zeros_like");
    }

    #[test]
    fn serde_roundtrip() {
        let p = Primitive::GetItem;
        let json = serde_json::to_string(&p).unwrap();
        let back: Primitive = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
