//! Call frames and the environment chain.
//!
//! Each graph call gets a [`Frame`] whose parent is the environment the
//! closure was materialized in, so the chain mirrors lexical nesting, not
//! the call stack. Node values memoize within their frame: when a
//! backpropagator runs, the forward frame it hangs off still holds every
//! intermediate the forward pass computed.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use anfad_ir::{GraphId, NodeId};

use crate::value::Value;

/// A shared, interiorly-mutable frame.
pub type Env = Rc<Frame>;

/// One frame of the environment chain: the graph it executes (the root
/// frame executes none) and the node values bound or memoized in it.
#[derive(Debug)]
pub struct Frame {
    graph: Option<GraphId>,
    values: RefCell<IndexMap<NodeId, Value>>,
    parent: Option<Env>,
}

impl Frame {
    /// The empty top-level environment.
    pub fn root() -> Env {
        Rc::new(Frame {
            graph: None,
            values: RefCell::new(IndexMap::new()),
            parent: None,
        })
    }

    /// A frame for one call of `graph`, chained under `parent`.
    pub fn child(parent: &Env, graph: GraphId) -> Env {
        Rc::new(Frame {
            graph: Some(graph),
            values: RefCell::new(IndexMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// The graph this frame executes.
    pub fn graph(&self) -> Option<GraphId> {
        self.graph
    }

    /// The value bound to `node` in this frame, if any.
    pub fn get(&self, node: NodeId) -> Option<Value> {
        self.values.borrow().get(&node).cloned()
    }

    /// Binds `node` in this frame.
    pub fn set(&self, node: NodeId, value: Value) {
        self.values.borrow_mut().insert(node, value);
    }
}

/// Walks the chain from `env` outward to the innermost frame executing
/// `owner`.
pub fn lookup_frame(env: &Env, owner: GraphId) -> Option<Env> {
    let mut at = Some(env.clone());
    while let Some(frame) = at {
        if frame.graph == Some(owner) {
            return Some(frame);
        }
        at = frame.parent.clone();
    }
    None
}
