//! Reference evaluator.
//!
//! Walks the graph recursively from a root. There is no memoization: a node reachable
//! through several parents is recomputed once per path, so heavily shared graphs cost
//! time exponential in their depth. Every other backend must reproduce these results.

use crate::errors::EvalError;
use crate::node::{Node, NodeIndex};
use crate::store::NodeStore;

/// Evaluates the node at `root` for the given input vector.
///
/// # Errors
/// Returns [`EvalError::InputTooShort`] if a reachable variable refers to a slot
/// past the end of `inputs`.
///
/// # Panics
/// Panics if `root` or a reachable child is outside the store.
pub fn evaluate(store: &NodeStore, root: NodeIndex, inputs: &[f64]) -> Result<f64, EvalError> {
    match store.node(root) {
        Node::Variable(slot) => inputs
            .get(slot as usize)
            .copied()
            .ok_or(EvalError::InputTooShort {
                slot,
                len: inputs.len(),
            }),
        Node::Constant(value) => Ok(value),
        Node::Operation { op, lhs, rhs } => {
            let lhs = evaluate(store, lhs, inputs)?;
            let rhs = evaluate(store, rhs, inputs)?;
            Ok(op.apply(lhs, rhs))
        }
        Node::Function { function, argument } => {
            Ok(function.apply(evaluate(store, argument, inputs)?))
        }
        Node::Malformed { .. } => Ok(f64::NAN),
    }
}
