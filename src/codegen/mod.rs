//! Code generation from the node graph.
//!
//! All native backends share one schedule: an iterative post-order walk from the root
//! that yields a [`Step`] per node, children strictly before their parent. The walk keeps
//! an explicit stack of [`Visit`]s instead of recursing, so arbitrarily deep graphs are
//! fine.
//!
//! Generated routines use a scratch array addressed by *global* node index: node `i`
//! writes `scratch[i]` and reads its children from `scratch[child]`. The scratch array
//! therefore needs `root + 1` slots, which is what `dim()` reports.
//!
//! Like the interpreter, the walk keeps no visited set: a node shared by several parents
//! is emitted once per reference. Re-emission rewrites the same slot with the same
//! value, so results are unaffected.

pub mod asm;
pub mod source;

use std::fmt;

use crate::node::{Function, Node, NodeIndex, Operation};
use crate::store::NodeStore;

/// Target text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    /// Portable C source
    #[default]
    C,
    /// x86-64 System V assembly in NASM syntax
    Nasm,
}

impl Language {
    /// File extension of the generated text.
    pub fn extension(self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Nasm => "asm",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "c"),
            Language::Nasm => write!(f, "nasm"),
        }
    }
}

/// Work item of the traversal stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// First visit: leaves are emitted, inner nodes schedule their children.
    Enter(NodeIndex),
    /// All children are emitted; emit the node itself.
    Emit(NodeIndex),
}

/// One instruction of the evaluation schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// `scratch[index] = inputs[slot]`
    Load { index: NodeIndex, slot: u32 },
    /// `scratch[index] = value`
    Constant { index: NodeIndex, value: f64 },
    /// `scratch[index] = scratch[lhs] op scratch[rhs]`
    Operation {
        index: NodeIndex,
        op: Operation,
        lhs: NodeIndex,
        rhs: NodeIndex,
    },
    /// `scratch[index] = function(scratch[argument])`
    Function {
        index: NodeIndex,
        function: Function,
        argument: NodeIndex,
    },
}

impl Step {
    pub fn index(&self) -> NodeIndex {
        match *self {
            Step::Load { index, .. }
            | Step::Constant { index, .. }
            | Step::Operation { index, .. }
            | Step::Function { index, .. } => index,
        }
    }
}

/// Iterative post-order traversal yielding [`Step`]s.
///
/// Malformed records are emitted as a NaN constant, matching the interpreter.
pub struct PostOrder<'a> {
    store: &'a NodeStore,
    stack: Vec<Visit>,
    max_index: u32,
    input_len: usize,
}

impl<'a> PostOrder<'a> {
    /// # Panics
    /// Panics if `root` is outside the store.
    pub fn new(store: &'a NodeStore, root: NodeIndex) -> Self {
        assert!(
            root.as_usize() < store.len(),
            "root {root} is outside a store of {} nodes",
            store.len()
        );
        Self {
            store,
            stack: vec![Visit::Enter(root)],
            max_index: root.get(),
            input_len: 0,
        }
    }

    /// Largest node index visited so far, plus one.
    pub fn dim(&self) -> usize {
        self.max_index as usize + 1
    }

    /// Largest variable slot visited so far, plus one.
    pub fn input_len(&self) -> usize {
        self.input_len
    }
}

impl Iterator for PostOrder<'_> {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        while let Some(visit) = self.stack.pop() {
            match visit {
                Visit::Enter(index) => {
                    self.max_index = self.max_index.max(index.get());
                    match self.store.node(index) {
                        Node::Variable(slot) => {
                            self.input_len = self.input_len.max(slot as usize + 1);
                            return Some(Step::Load { index, slot });
                        }
                        Node::Constant(value) => return Some(Step::Constant { index, value }),
                        Node::Operation { lhs, rhs, .. } => {
                            self.stack.push(Visit::Emit(index));
                            self.stack.push(Visit::Enter(rhs));
                            self.stack.push(Visit::Enter(lhs));
                        }
                        Node::Function { argument, .. } => {
                            self.stack.push(Visit::Emit(index));
                            self.stack.push(Visit::Enter(argument));
                        }
                        Node::Malformed { .. } => {
                            return Some(Step::Constant {
                                index,
                                value: f64::NAN,
                            })
                        }
                    }
                }
                Visit::Emit(index) => match self.store.node(index) {
                    Node::Operation { op, lhs, rhs } => {
                        return Some(Step::Operation { index, op, lhs, rhs })
                    }
                    Node::Function { function, argument } => {
                        return Some(Step::Function {
                            index,
                            function,
                            argument,
                        })
                    }
                    other => unreachable!("deferred emit of a leaf node {other:?}"),
                },
            }
        }
        None
    }
}

/// Output of a code generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub language: Language,
    pub text: String,
    /// Scratch slots the routine touches; the value returned by its `dim()`.
    pub dim: usize,
    /// Minimum input vector length.
    pub input_len: usize,
}

/// Generates a routine with entry points `dim()` and `eval(inputs, scratch)` for `root`.
pub fn generate(store: &NodeStore, root: NodeIndex, language: Language) -> GeneratedCode {
    match language {
        Language::C => source::generate(store, root),
        Language::Nasm => asm::generate(store, root),
    }
}
