//! A small reference interpreter for programs, including the derived
//! forward and backpropagator graphs.
//!
//! Evaluation is environment-based: a closure captures the frame it was
//! materialized in, and node values memoize per frame. That memoization is
//! what lets a backpropagator reuse the intermediates of the forward call
//! it belongs to instead of recomputing them.

use tracing::trace;

use anfad_grad::Grad;
use anfad_ir::{ConstValue, GraphId, IrError, NodeId, NodeKind, Primitive, Program};

use crate::env::{lookup_frame, Env, Frame};
use crate::error::EvalError;
use crate::value::Value;

/// An interpreter over one program. Owns the program so that lifting a
/// closure can extend it with derived graphs on the fly.
#[derive(Debug)]
pub struct Vm {
    program: Program,
    grad: Grad,
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            grad: Grad::new(),
        }
    }

    /// The program, including any graphs derived since construction.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Materializes `graph` as a closure over the empty environment.
    pub fn closure(&self, graph: GraphId) -> Value {
        Value::Closure {
            graph,
            env: Frame::root(),
        }
    }

    /// Derives the forward graph of `graph`, reusing earlier derivations.
    pub fn differentiate(&mut self, graph: GraphId) -> Result<GraphId, EvalError> {
        Ok(self.grad.process_graph(&mut self.program, graph)?)
    }

    /// Calls `graph` as a top-level closure.
    pub fn call_graph(&mut self, graph: GraphId, args: Vec<Value>) -> Result<Value, EvalError> {
        let fun = self.closure(graph);
        self.call(fun, args)
    }

    /// Applies a callable value to arguments.
    pub fn call(&mut self, fun: Value, args: Vec<Value>) -> Result<Value, EvalError> {
        match fun {
            Value::Closure { graph, env } => {
                trace!(graph = %graph, args = args.len(), "call");
                let params = self.program.parameters(graph).to_vec();
                if params.len() != args.len() {
                    return Err(EvalError::ArityMismatch {
                        graph,
                        expected: params.len(),
                        got: args.len(),
                    });
                }
                let frame = Frame::child(&env, graph);
                for (&param, arg) in params.iter().zip(args) {
                    frame.set(param, arg);
                }
                let output = self
                    .program
                    .graph(graph)
                    .output()
                    .ok_or(IrError::MissingOutput { graph })?;
                self.eval(output, &frame)
            }
            Value::Prim(prim) => self.apply_primitive(prim, args),
            Value::LiftedPrim(prim) => {
                let result = self.apply_primitive(prim, args.clone())?;
                Ok(Value::Tuple(vec![
                    result,
                    Value::PrimBprop { prim, args },
                ]))
            }
            Value::PrimBprop { prim, args: primal } => {
                let (dz,) = one(prim, args)?;
                prim_backward(prim, &primal, dz)
            }
            other => Err(EvalError::NotCallable {
                what: other.type_name(),
            }),
        }
    }

    fn eval(&mut self, node: NodeId, env: &Env) -> Result<Value, EvalError> {
        match self.program.node(node).owner {
            Some(owner) => {
                let frame =
                    lookup_frame(env, owner).ok_or(EvalError::OutOfScope { node })?;
                if let Some(value) = frame.get(node) {
                    return Ok(value);
                }
                let value = self.eval_in(node, &frame)?;
                frame.set(node, value.clone());
                Ok(value)
            }
            None => self.eval_in(node, env),
        }
    }

    fn eval_in(&mut self, node: NodeId, env: &Env) -> Result<Value, EvalError> {
        let kind = self.program.node(node).kind.clone();
        match kind {
            NodeKind::Parameter => Err(EvalError::UnboundParameter { node }),
            NodeKind::Constant(value) => Ok(const_value(value, env)),
            NodeKind::Apply(inputs) => {
                let fun = self.eval(inputs[0], env)?;
                let mut args = Vec::with_capacity(inputs.len() - 1);
                for &input in &inputs[1..] {
                    args.push(self.eval(input, env)?);
                }
                self.call(fun, args)
            }
        }
    }

    fn apply_primitive(&mut self, prim: Primitive, args: Vec<Value>) -> Result<Value, EvalError> {
        match prim {
            Primitive::Add => {
                let (a, b) = two(prim, args)?;
                add_values(a, b)
            }
            Primitive::Sub | Primitive::Mul | Primitive::Div => {
                let (a, b) = two(prim, args)?;
                arith(prim, a, b)
            }
            Primitive::Neg => {
                let (a,) = one(prim, args)?;
                neg(a)
            }
            Primitive::MakeTuple => Ok(Value::Tuple(args)),
            Primitive::ConsTuple => {
                let (head, tail) = two(prim, args)?;
                match tail {
                    Value::Tuple(mut items) => {
                        items.insert(0, head);
                        Ok(Value::Tuple(items))
                    }
                    other => Err(EvalError::TypeMismatch {
                        op: prim,
                        got: other.type_name(),
                    }),
                }
            }
            Primitive::GetItem => {
                let (value, index) = two(prim, args)?;
                let index = match index {
                    Value::Int(i) => i,
                    other => {
                        return Err(EvalError::TypeMismatch {
                            op: prim,
                            got: other.type_name(),
                        })
                    }
                };
                match value {
                    // Projecting out of a zero gradient is a zero gradient.
                    Value::Zero => Ok(Value::Zero),
                    Value::Tuple(items) => {
                        let len = items.len();
                        usize::try_from(index)
                            .ok()
                            .and_then(|i| items.into_iter().nth(i))
                            .ok_or(EvalError::IndexOutOfBounds { index, len })
                    }
                    other => Err(EvalError::TypeMismatch {
                        op: prim,
                        got: other.type_name(),
                    }),
                }
            }
            Primitive::Lift => {
                let (value,) = one(prim, args)?;
                self.lift_value(value)
            }
            Primitive::Unlift => {
                let (value,) = one(prim, args)?;
                match value {
                    Value::Float(_) | Value::Int(_) => Ok(value),
                    other => Err(EvalError::UnsupportedUnlift {
                        what: other.type_name(),
                    }),
                }
            }
            Primitive::ZerosLike => {
                let (value,) = one(prim, args)?;
                Ok(zeros_like(&value))
            }
        }
    }

    /// Moves a value into the forward world: scalars stay themselves,
    /// differentiable primitives become their lifted form, and a top-level
    /// closure becomes a closure over its derived forward graph.
    fn lift_value(&mut self, value: Value) -> Result<Value, EvalError> {
        match value {
            Value::Float(_) | Value::Int(_) => Ok(value),
            Value::Prim(prim) => match prim {
                Primitive::Add
                | Primitive::Sub
                | Primitive::Mul
                | Primitive::Div
                | Primitive::Neg => Ok(Value::LiftedPrim(prim)),
                other => Err(EvalError::UnsupportedLift { what: other.name() }),
            },
            Value::Closure { graph, env } if env.graph().is_none() => {
                let forward = self.grad.process_graph(&mut self.program, graph)?;
                Ok(Value::Closure {
                    graph: forward,
                    env,
                })
            }
            other => Err(EvalError::UnsupportedLift {
                what: other.type_name(),
            }),
        }
    }
}

fn const_value(value: ConstValue, env: &Env) -> Value {
    match value {
        ConstValue::Float(v) => Value::Float(v),
        ConstValue::Int(v) => Value::Int(v),
        ConstValue::Bool(v) => Value::Bool(v),
        ConstValue::Unit => Value::Tuple(Vec::new()),
        ConstValue::Prim(prim) => Value::Prim(prim),
        ConstValue::Graph(graph) => Value::Closure {
            graph,
            env: env.clone(),
        },
    }
}

fn one(prim: Primitive, args: Vec<Value>) -> Result<(Value,), EvalError> {
    match <[Value; 1]>::try_from(args) {
        Ok([a]) => Ok((a,)),
        Err(args) => Err(EvalError::PrimitiveArity {
            prim,
            expected: 1,
            got: args.len(),
        }),
    }
}

fn two(prim: Primitive, args: Vec<Value>) -> Result<(Value, Value), EvalError> {
    match <[Value; 2]>::try_from(args) {
        Ok([a, b]) => Ok((a, b)),
        Err(args) => Err(EvalError::PrimitiveArity {
            prim,
            expected: 2,
            got: args.len(),
        }),
    }
}

/// Gradient addition: absorbs [`Value::Zero`] and sums tuples pointwise.
fn add_values(a: Value, b: Value) -> Result<Value, EvalError> {
    match (a, b) {
        (Value::Zero, x) | (x, Value::Zero) => Ok(x),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x + y)),
        (Value::Tuple(xs), Value::Tuple(ys)) => {
            if xs.len() != ys.len() {
                return Err(EvalError::TypeMismatch {
                    op: Primitive::Add,
                    got: "tuples of unequal length",
                });
            }
            let mut out = Vec::with_capacity(xs.len());
            for (x, y) in xs.into_iter().zip(ys) {
                out.push(add_values(x, y)?);
            }
            Ok(Value::Tuple(out))
        }
        (a, _) => Err(EvalError::TypeMismatch {
            op: Primitive::Add,
            got: a.type_name(),
        }),
    }
}

fn arith(prim: Primitive, a: Value, b: Value) -> Result<Value, EvalError> {
    match (prim, a, b) {
        (Primitive::Sub, Value::Float(x), Value::Float(y)) => Ok(Value::Float(x - y)),
        (Primitive::Sub, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x - y)),
        (Primitive::Mul, Value::Float(x), Value::Float(y)) => Ok(Value::Float(x * y)),
        (Primitive::Mul, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x * y)),
        (Primitive::Div, Value::Float(x), Value::Float(y)) => Ok(Value::Float(x / y)),
        (Primitive::Div, Value::Int(_), Value::Int(0)) => Err(EvalError::DivideByZero),
        (Primitive::Div, Value::Int(x), Value::Int(y)) => Ok(Value::Int(x / y)),
        (prim, a, _) => Err(EvalError::TypeMismatch {
            op: prim,
            got: a.type_name(),
        }),
    }
}

fn neg(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Float(x) => Ok(Value::Float(-x)),
        Value::Int(x) => Ok(Value::Int(-x)),
        other => Err(EvalError::TypeMismatch {
            op: Primitive::Neg,
            got: other.type_name(),
        }),
    }
}

/// The zero gradient with the shape of `value`. Values with no numeric
/// shape get the polymorphic [`Value::Zero`]; first-class functions get
/// the empty tuple, matching the leading slot of every backpropagator
/// result.
fn zeros_like(value: &Value) -> Value {
    match value {
        Value::Float(_) => Value::Float(0.0),
        Value::Int(_) => Value::Int(0),
        Value::Bool(_) => Value::Bool(false),
        Value::Tuple(items) => Value::Tuple(items.iter().map(zeros_like).collect()),
        Value::Prim(_) | Value::LiftedPrim(_) => Value::Tuple(Vec::new()),
        Value::Closure { .. } | Value::PrimBprop { .. } | Value::Zero => Value::Zero,
    }
}

/// The backward rule of one primitive application: sensitivities for the
/// primitive itself (always the empty tuple) and for each argument.
fn prim_backward(prim: Primitive, primal: &[Value], dz: Value) -> Result<Value, EvalError> {
    let wrap = |grads: Vec<Value>| {
        let mut out = Vec::with_capacity(grads.len() + 1);
        out.push(Value::Tuple(Vec::new()));
        out.extend(grads);
        Value::Tuple(out)
    };
    match (prim, primal) {
        (Primitive::Add, [_, _]) => Ok(wrap(vec![dz.clone(), dz])),
        (Primitive::Sub, [_, _]) => {
            let gy = neg(dz.clone())?;
            Ok(wrap(vec![dz, gy]))
        }
        (Primitive::Mul, [x, y]) => {
            let gx = arith(Primitive::Mul, dz.clone(), y.clone())?;
            let gy = arith(Primitive::Mul, dz, x.clone())?;
            Ok(wrap(vec![gx, gy]))
        }
        (Primitive::Div, [x, y]) => {
            let gx = arith(Primitive::Div, dz.clone(), y.clone())?;
            let num = arith(Primitive::Mul, dz, x.clone())?;
            let den = arith(Primitive::Mul, y.clone(), y.clone())?;
            let gy = neg(arith(Primitive::Div, num, den)?)?;
            Ok(wrap(vec![gx, gy]))
        }
        (Primitive::Neg, [_]) => {
            let gx = neg(dz)?;
            Ok(wrap(vec![gx]))
        }
        (prim, _) => Err(EvalError::UnsupportedLift { what: prim.name() }),
    }
}
