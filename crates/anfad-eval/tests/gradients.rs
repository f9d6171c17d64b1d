//! End-to-end gradient checks: build a source program, derive its forward
//! and backpropagator graphs, and run both through the interpreter.

use proptest::prelude::*;

use anfad_eval::{EvalError, Value, Vm};
use anfad_ir::{GraphId, Primitive, Program};

/// Runs the forward graph of `graph` on `args`, checks the primal against
/// a direct call of the source graph, unwinds the backpropagator with an
/// output sensitivity of 1.0, and returns (primal, gradient per argument).
fn run_grad(vm: &mut Vm, graph: GraphId, args: &[f64]) -> (f64, Vec<f64>) {
    let inputs: Vec<Value> = args.iter().map(|&v| Value::Float(v)).collect();

    let direct = vm.call_graph(graph, inputs.clone()).unwrap();
    let forward = vm.differentiate(graph).unwrap();
    let pair = vm.call_graph(forward, inputs).unwrap();
    let Value::Tuple(mut pair) = pair else {
        panic!("forward result is not a pair");
    };
    assert_eq!(pair.len(), 2);
    let bprop = pair.pop().unwrap();
    let primal = pair.pop().unwrap();
    assert_eq!(primal, direct, "forward primal drifted from the source graph");
    let Value::Float(primal) = primal else {
        panic!("primal is not a float: {primal:?}");
    };

    let grads = vm.call(bprop, vec![Value::Float(1.0)]).unwrap();
    let Value::Tuple(grads) = grads else {
        panic!("backpropagator result is not a tuple");
    };
    assert_eq!(grads.len(), args.len() + 1);
    assert_eq!(grads[0], Value::Tuple(vec![]), "a closed root has no fv slot");
    let grads = grads[1..]
        .iter()
        .map(|g| match g {
            Value::Float(v) => *v,
            other => panic!("gradient is not a float: {other:?}"),
        })
        .collect();
    (primal, grads)
}

fn square(p: &mut Program) -> GraphId {
    let g = p.add_named_graph("square");
    let x = p.parameter(g);
    let mul = p.prim_constant(Primitive::Mul);
    let a = p.apply(g, [mul, x, x]);
    p.set_output(g, a);
    g
}

#[test]
fn square_at_three() {
    let mut p = Program::new();
    let g = square(&mut p);
    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, g, &[3.0]);
    assert_eq!(primal, 9.0);
    assert_eq!(grads, [6.0]);
}

#[test]
fn cube_with_shared_intermediate() {
    // f(x) = (x*x) * x, with x*x feeding two consumers.
    let mut p = Program::new();
    let g = p.add_named_graph("cube");
    let x = p.parameter(g);
    let mul = p.prim_constant(Primitive::Mul);
    let a = p.apply(g, [mul, x, x]);
    let b = p.apply(g, [mul, a, x]);
    p.set_output(g, b);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, g, &[2.0]);
    assert_eq!(primal, 8.0);
    assert_eq!(grads, [12.0]);
}

#[test]
fn two_parameters() {
    // f(x, y) = x*y + x  ->  df/dx = y + 1, df/dy = x
    let mut p = Program::new();
    let g = p.add_named_graph("bilinear");
    let x = p.parameter(g);
    let y = p.parameter(g);
    let mul = p.prim_constant(Primitive::Mul);
    let xy = p.apply(g, [mul, x, y]);
    let add = p.prim_constant(Primitive::Add);
    let out = p.apply(g, [add, xy, x]);
    p.set_output(g, out);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, g, &[3.0, 5.0]);
    assert_eq!(primal, 18.0);
    assert_eq!(grads, [6.0, 3.0]);
}

#[test]
fn unused_parameter_gets_zero_gradient() {
    let mut p = Program::new();
    let g = p.add_named_graph("fst_sq");
    let x = p.parameter(g);
    let _y = p.parameter(g);
    let mul = p.prim_constant(Primitive::Mul);
    let out = p.apply(g, [mul, x, x]);
    p.set_output(g, out);

    let mut vm = Vm::new(p);
    let (_, grads) = run_grad(&mut vm, g, &[4.0, 7.0]);
    assert_eq!(grads, [8.0, 0.0]);
}

#[test]
fn sub_div_neg_rules() {
    // f(x) = -((1 - x) / x)  ->  df/dx = 1/x^2
    let mut p = Program::new();
    let g = p.add_named_graph("rational");
    let x = p.parameter(g);
    let one = p.float_constant(1.0);
    let sub = p.prim_constant(Primitive::Sub);
    let num = p.apply(g, [sub, one, x]);
    let div = p.prim_constant(Primitive::Div);
    let quot = p.apply(g, [div, num, x]);
    let neg = p.prim_constant(Primitive::Neg);
    let out = p.apply(g, [neg, quot]);
    p.set_output(g, out);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, g, &[2.0]);
    assert!((primal - 0.5).abs() < 1e-12);
    assert!((grads[0] - 0.25).abs() < 1e-12);
}

#[test]
fn gradient_flows_into_a_captured_variable() {
    // outer(d) = inner(3)  where  inner(y) = y * d  ->  df/dd = 3
    let mut p = Program::new();
    let outer = p.add_named_graph("outer");
    let d = p.parameter(outer);
    let inner = p.add_named_graph("inner");
    let y = p.parameter(inner);
    let mul = p.prim_constant(Primitive::Mul);
    let body = p.apply(inner, [mul, y, d]);
    p.set_output(inner, body);
    let inner_ref = p.graph_constant(inner);
    let three = p.float_constant(3.0);
    let call = p.apply(outer, [inner_ref, three]);
    p.set_output(outer, call);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, outer, &[5.0]);
    assert_eq!(primal, 15.0);
    assert_eq!(grads, [3.0]);
}

#[test]
fn gradient_routes_through_an_intermediate_graph() {
    // outer(d) = mid()  where  mid() = leaf(4)  and  leaf(y) = y * d.
    // The sensitivity of d must travel leaf -> mid -> outer even though
    // mid never uses d directly.
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
    let four = p.float_constant(4.0);
    let mid_out = p.apply(mid, [leaf_ref, four]);
    p.set_output(mid, mid_out);

    let mid_ref = p.graph_constant(mid);
    let outer_out = p.apply(outer, [mid_ref]);
    p.set_output(outer, outer_out);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, outer, &[2.0]);
    assert_eq!(primal, 8.0);
    assert_eq!(grads, [4.0]);
}

#[test]
fn dead_code_does_not_disturb_the_gradient() {
    let mut p = Program::new();
    let g = p.add_named_graph("with_dead");
    let x = p.parameter(g);
    let mul = p.prim_constant(Primitive::Mul);
    let _dead = p.apply(g, [mul, x, x]);
    let live = p.apply(g, [mul, x, x]);
    p.set_output(g, live);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, g, &[3.0]);
    assert_eq!(primal, 9.0);
    assert_eq!(grads, [6.0]);
}

#[test]
fn a_constant_shared_between_sibling_graphs() {
    // root(x) = a(x) + b(x), with a single Mul constant node appearing in
    // the bodies of both a and b. Constants have no owner, so sharing one
    // across graphs is legal; each forward graph still needs the lifted
    // form in its own scope.
    let mut p = Program::new();
    let mul = p.prim_constant(Primitive::Mul);

    let a = p.add_named_graph("a");
    let xa = p.parameter(a);
    let sq_a = p.apply(a, [mul, xa, xa]);
    p.set_output(a, sq_a);

    let b = p.add_named_graph("b");
    let xb = p.parameter(b);
    let sq_b = p.apply(b, [mul, xb, xb]);
    p.set_output(b, sq_b);

    let root = p.add_named_graph("root");
    let x = p.parameter(root);
    let a_ref = p.graph_constant(a);
    let b_ref = p.graph_constant(b);
    let left = p.apply(root, [a_ref, x]);
    let right = p.apply(root, [b_ref, x]);
    let add = p.prim_constant(Primitive::Add);
    let sum = p.apply(root, [add, left, right]);
    p.set_output(root, sum);

    let mut vm = Vm::new(p);
    let (primal, grads) = run_grad(&mut vm, root, &[3.0]);
    assert_eq!(primal, 18.0);
    assert_eq!(grads, [12.0]);
}

#[test]
fn derived_graphs_are_reused_across_calls() {
    let mut p = Program::new();
    let g = square(&mut p);
    let mut vm = Vm::new(p);

    let f1 = vm.differentiate(g).unwrap();
    let nodes = vm.program().node_count();
    let f2 = vm.differentiate(g).unwrap();
    assert_eq!(f1, f2);
    assert_eq!(vm.program().node_count(), nodes);

    let (_, g1) = run_grad(&mut vm, g, &[1.5]);
    let (_, g2) = run_grad(&mut vm, g, &[-2.5]);
    assert_eq!(g1, [3.0]);
    assert_eq!(g2, [-5.0]);
}

#[test]
fn lifting_a_value_level_closure() {
    // Exercise the lift primitive on a closure rather than going through
    // Vm::differentiate.
    let mut p = Program::new();
    let g = square(&mut p);
    let mut vm = Vm::new(p);

    let lifted = vm
        .call(Value::Prim(Primitive::Lift), vec![vm.closure(g)])
        .unwrap();
    let pair = vm.call(lifted, vec![Value::Float(3.0)]).unwrap();
    let Value::Tuple(items) = pair else {
        panic!("forward result is not a pair");
    };
    assert_eq!(items[0], Value::Float(9.0));

    let grads = vm.call(items[1].clone(), vec![Value::Float(1.0)]).unwrap();
    assert_eq!(
        grads,
        Value::Tuple(vec![Value::Tuple(vec![]), Value::Float(6.0)])
    );
}

#[test]
fn lifting_a_capturing_closure_is_rejected() {
    // A closure over a non-empty environment cannot be lifted at the value
    // level; differentiation happens at its materialization site instead.
    let mut p = Program::new();
    let outer = p.add_named_graph("outer");
    let d = p.parameter(outer);
    let inner = p.add_named_graph("inner");
    let y = p.parameter(inner);
    let mul = p.prim_constant(Primitive::Mul);
    let body = p.apply(inner, [mul, y, d]);
    p.set_output(inner, body);
    // outer returns inner as a value.
    let inner_ref = p.graph_constant(inner);
    let mk = p.prim_constant(Primitive::MakeTuple);
    let out = p.apply(outer, [mk, inner_ref]);
    p.set_output(outer, out);

    let mut vm = Vm::new(p);
    let result = vm.call_graph(outer, vec![Value::Float(2.0)]).unwrap();
    let Value::Tuple(items) = result else {
        panic!("expected a tuple");
    };
    let err = vm
        .call(Value::Prim(Primitive::Lift), vec![items[0].clone()])
        .unwrap_err();
    assert!(matches!(err, EvalError::UnsupportedLift { what: "closure" }));
}

proptest! {
    #[test]
    fn square_gradient_is_two_x(x in -1000.0f64..1000.0) {
        let mut p = Program::new();
        let g = square(&mut p);
        let mut vm = Vm::new(p);
        let (primal, grads) = run_grad(&mut vm, g, &[x]);
        prop_assert!((primal - x * x).abs() <= 1e-9 * x.abs().max(1.0).powi(2));
        prop_assert!((grads[0] - 2.0 * x).abs() <= 1e-9 * x.abs().max(1.0));
    }
}
