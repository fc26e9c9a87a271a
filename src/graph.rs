//! Recording arithmetic into a node graph.
//!
//! [`Graph`] owns a [`NodeStore`] behind a `RefCell`, which keeps it single-threaded: the
//! type is not `Sync`, so two threads can never append to the same table. Graph handles
//! ([`Expr`]) borrow the graph and are `Copy`; arithmetic on them appends a new node that
//! references the operands by index.
//!
//! # Example
//!
//! ```rust
//! use fncas::prelude::*;
//!
//! let graph = Graph::new();
//! let x = graph.placeholder(2);
//! let f = (x.at(0) + x.at(1)) * x.at(0) - 3.0;
//!
//! assert_eq!(f.to_string(), "(((x[0] + x[1]) * x[0]) - 3)");
//! assert_eq!(f.eval(&[2.0, 5.0]).unwrap(), 11.0);
//! ```

use std::cell::{Ref, RefCell};
use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use crate::codegen::{self, GeneratedCode, Language};
use crate::config::CompileOptions;
use crate::errors::{CompileError, EvalError, JitError};
use crate::inputs::{Inputs, Scalar};
use crate::interpreter;
use crate::jit::{self, JitFunction};
use crate::loader::{self, CompiledFunction};
use crate::node::{Function, Node, NodeIndex, Operation};
use crate::store::NodeStore;

/// A recording session: one node table plus the operations that append to it.
#[derive(Debug, Default)]
pub struct Graph {
    store: RefCell<NodeStore>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing table, e.g. one restored with [`NodeStore::from_bytes`].
    pub fn from_store(store: NodeStore) -> Self {
        Self {
            store: RefCell::new(store),
        }
    }

    pub fn into_store(self) -> NodeStore {
        self.store.into_inner()
    }

    /// Read access to the underlying table.
    ///
    /// # Panics
    /// Panics if called while a node is being appended.
    pub fn store(&self) -> Ref<'_, NodeStore> {
        self.store.borrow()
    }

    pub fn len(&self) -> usize {
        self.store.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.borrow().is_empty()
    }

    /// Placeholder input vector of dimension `dim`.
    ///
    /// # Panics
    /// Panics if `dim` is zero.
    pub fn placeholder(&self, dim: usize) -> Placeholder<'_> {
        assert!(dim > 0, "placeholder dimension must be positive");
        Placeholder { graph: self, dim }
    }

    /// Handle for an already recorded node.
    ///
    /// # Panics
    /// Panics if `index` is not part of this graph.
    pub fn expr(&self, index: NodeIndex) -> Expr<'_> {
        assert!(
            index.as_usize() < self.len(),
            "node {index} is not part of this graph"
        );
        Expr { graph: self, index }
    }

    /// Records a read of input slot `slot`.
    pub fn variable(&self, slot: u32) -> Expr<'_> {
        self.push(Node::Variable(slot))
    }

    /// Records a literal. The exact bits of `value`, NaN payloads included, reach every
    /// backend.
    pub fn constant(&self, value: f64) -> Expr<'_> {
        self.push(Node::Constant(value))
    }

    /// Records a binary operation on two nodes of this graph.
    ///
    /// Operator overloading on [`Expr`] calls this; use it directly when the operation is
    /// only known at runtime.
    ///
    /// # Arguments
    /// * `op` - Arithmetic operation to record
    /// * `lhs` - Left operand, recorded earlier in this graph
    /// * `rhs` - Right operand, recorded earlier in this graph
    ///
    /// # Returns
    /// Handle to the new node, whose index is larger than both operands'.
    ///
    /// # Panics
    /// Panics if either operand belongs to another graph.
    pub fn operation<'g>(&'g self, op: Operation, lhs: Expr<'g>, rhs: Expr<'g>) -> Expr<'g> {
        self.assert_owns(lhs);
        self.assert_owns(rhs);
        self.push(Node::Operation {
            op,
            lhs: lhs.index,
            rhs: rhs.index,
        })
    }

    /// Records a unary math function applied to `argument`.
    ///
    /// # Panics
    /// Panics if `argument` belongs to another graph.
    pub fn function<'g>(&'g self, function: Function, argument: Expr<'g>) -> Expr<'g> {
        self.assert_owns(argument);
        self.push(Node::Function {
            function,
            argument: argument.index,
        })
    }

    /// Interprets the subgraph rooted at `root`.
    ///
    /// # Arguments
    /// * `root` - Node to evaluate
    /// * `inputs` - Values of the input slots, at least as many as the subgraph reads
    ///
    /// # Errors
    /// Returns [`EvalError::InputTooShort`] if a variable reads past the end of `inputs`.
    pub fn evaluate(&self, root: NodeIndex, inputs: &[f64]) -> Result<f64, EvalError> {
        interpreter::evaluate(&self.store.borrow(), root, inputs)
    }

    /// Generates code for the subgraph rooted at `root`.
    pub fn generate(&self, root: NodeIndex, language: Language) -> GeneratedCode {
        codegen::generate(&self.store.borrow(), root, language)
    }

    /// Builds and loads a native library for the subgraph rooted at `root`.
    ///
    /// # Errors
    /// Returns a [`CompileError`] if the source cannot be written, the toolchain fails or
    /// the library does not load.
    pub fn compile(
        &self,
        root: NodeIndex,
        options: &CompileOptions,
    ) -> Result<CompiledFunction, CompileError> {
        loader::compile(&self.store.borrow(), root, options)
    }

    /// JIT compiles the subgraph rooted at `root` in-process.
    pub fn jit(&self, root: NodeIndex) -> Result<JitFunction, JitError> {
        jit::build_function(&self.store.borrow(), root)
    }

    fn push(&self, node: Node) -> Expr<'_> {
        let index = self.store.borrow_mut().push(node);
        Expr { graph: self, index }
    }

    fn assert_owns(&self, expr: Expr<'_>) {
        assert!(
            std::ptr::eq(self, expr.graph),
            "cannot combine nodes from different graphs"
        );
    }
}

/// Handle to one recorded node. Copying a handle copies the index only.
#[derive(Clone, Copy)]
pub struct Expr<'g> {
    graph: &'g Graph,
    index: NodeIndex,
}

impl<'g> Expr<'g> {
    /// Position of the node in its graph's table.
    pub fn index(self) -> NodeIndex {
        self.index
    }

    pub fn graph(self) -> &'g Graph {
        self.graph
    }

    pub fn node(self) -> Node {
        self.graph.store.borrow().node(self.index)
    }

    /// Interprets this node for the given inputs.
    pub fn eval(self, inputs: &[f64]) -> Result<f64, EvalError> {
        self.graph.evaluate(self.index, inputs)
    }

    /// Portable C source for this node.
    pub fn source(self) -> GeneratedCode {
        self.graph.generate(self.index, Language::C)
    }

    /// x86-64 NASM assembly for this node.
    pub fn assembly(self) -> GeneratedCode {
        self.graph.generate(self.index, Language::Nasm)
    }

    /// Builds and loads this node as a native function. See [`Graph::compile`].
    pub fn compile(self, options: &CompileOptions) -> Result<CompiledFunction, CompileError> {
        self.graph.compile(self.index, options)
    }

    pub fn jit(self) -> Result<JitFunction, JitError> {
        self.graph.jit(self.index)
    }
}

fn write_node(store: &NodeStore, index: NodeIndex, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match store.node(index) {
        Node::Variable(slot) => write!(f, "x[{slot}]"),
        Node::Constant(value) => write!(f, "{value}"),
        Node::Operation { op, lhs, rhs } => {
            write!(f, "(")?;
            write_node(store, lhs, f)?;
            write!(f, " {} ", op.symbol())?;
            write_node(store, rhs, f)?;
            write!(f, ")")
        }
        Node::Function { function, argument } => {
            write!(f, "{}(", function.name())?;
            write_node(store, argument, f)?;
            write!(f, ")")
        }
        Node::Malformed { .. } => write!(f, "?"),
    }
}

impl PartialEq for Expr<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.graph, other.graph) && self.index == other.index
    }
}

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({}: {})", self.index, self)
    }
}

impl fmt::Display for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(&self.graph.store.borrow(), self.index, f)
    }
}

macro_rules! record_operation {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<'g> $trait for Expr<'g> {
            type Output = Expr<'g>;

            fn $method(self, rhs: Expr<'g>) -> Expr<'g> {
                self.graph.operation($op, self, rhs)
            }
        }

        impl<'g> $trait<f64> for Expr<'g> {
            type Output = Expr<'g>;

            fn $method(self, rhs: f64) -> Expr<'g> {
                let rhs = self.graph.constant(rhs);
                self.graph.operation($op, self, rhs)
            }
        }

        impl<'g> $trait<Expr<'g>> for f64 {
            type Output = Expr<'g>;

            fn $method(self, rhs: Expr<'g>) -> Expr<'g> {
                let lhs = rhs.graph.constant(self);
                rhs.graph.operation($op, lhs, rhs)
            }
        }
    };
}

record_operation!(Add, add, Operation::Add);
record_operation!(Sub, sub, Operation::Subtract);
record_operation!(Mul, mul, Operation::Multiply);
record_operation!(Div, div, Operation::Divide);

impl Scalar for Expr<'_> {
    fn apply(self, function: Function) -> Self {
        self.graph.function(function, self)
    }
}

/// Stand-in for the input vector while recording. `at(i)` yields a fresh
/// `Variable` node for slot `i`.
#[derive(Debug, Clone, Copy)]
pub struct Placeholder<'g> {
    graph: &'g Graph,
    dim: usize,
}

impl<'g> Placeholder<'g> {
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }
}

impl<'g> Inputs for Placeholder<'g> {
    type Value = Expr<'g>;

    fn dim(&self) -> usize {
        self.dim
    }

    fn at(&self, i: usize) -> Expr<'g> {
        assert!(
            i < self.dim,
            "input index {i} out of range for placeholder of dimension {}",
            self.dim
        );
        let slot = u32::try_from(i).expect("input index exceeds 32 bits");
        self.graph.variable(slot)
    }

    fn constant(&self, value: f64) -> Expr<'g> {
        self.graph.constant(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f<X: Inputs + ?Sized>(x: &X) -> X::Value {
        (x.at(0) + x.at(1)) * x.at(0) - 3.0
    }

    #[test]
    fn test_recording_matches_direct() {
        let graph = Graph::new();
        let root = f(&graph.placeholder(2));
        let inputs = [2.0, 5.0];
        assert_eq!(f(&inputs[..]), 11.0);
        assert_eq!(root.eval(&inputs).unwrap(), 11.0);
    }

    #[test]
    fn test_recorded_layout() {
        let graph = Graph::new();
        let root = f(&graph.placeholder(2));
        // x0, x1, add, x0, mul, 3.0, sub
        assert_eq!(graph.len(), 7);
        assert_eq!(root.index(), NodeIndex::new(6));
        assert_eq!(
            root.node(),
            Node::Operation {
                op: Operation::Subtract,
                lhs: NodeIndex::new(4),
                rhs: NodeIndex::new(5)
            }
        );
        assert!(graph.store().iter().all(|(i, n)| n.children().all(|c| c < i)));
    }

    #[test]
    fn test_sub_expressions_are_not_deduplicated() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let a = x.at(0) * 2.0;
        let b = x.at(0) * 2.0;
        assert_ne!(a, b);
        assert_eq!(graph.len(), 6);
    }

    #[test]
    fn test_scalar_on_left() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let f = 1.0 / x.at(0);
        assert_eq!(f.to_string(), "(1 / x[0])");
        assert_eq!(f.eval(&[4.0]).unwrap(), 0.25);
    }

    #[test]
    fn test_functions_record_nodes() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let f = x.at(0).sin().exp();
        assert_eq!(f.to_string(), "exp(sin(x[0]))");
        assert_eq!(f.eval(&[0.0]).unwrap(), 1.0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_placeholder_bounds() {
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let _ = x.at(2);
    }

    #[test]
    #[should_panic(expected = "different graphs")]
    fn test_mixing_graphs_panics() {
        let a = Graph::new();
        let b = Graph::new();
        let _ = a.variable(0) + b.variable(0);
    }

    #[test]
    fn test_store_round_trip_through_graph() {
        let graph = Graph::new();
        let root = f(&graph.placeholder(2)).index();
        let restored = Graph::from_store(NodeStore::from_bytes(&graph.store().to_bytes()).unwrap());
        assert_eq!(restored.evaluate(root, &[2.0, 5.0]).unwrap(), 11.0);
    }
}
