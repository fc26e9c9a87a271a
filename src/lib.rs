//! Record mathematical functions once, evaluate them many ways.
//!
//! Arithmetic on graph handles is recorded into a table of packed, fixed-size nodes. A
//! recorded root can then be
//!
//! - interpreted directly,
//! - emitted as portable C or x86-64 NASM source,
//! - built with the system toolchain and loaded as a native function, or
//! - compiled in-process with [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift).
//!
//! Every backend computes the same IEEE 754 double-precision result as the interpreter.
//! Expressions given as strings are parsed with [evalexpr](https://github.com/ISibboI/evalexpr).
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
//! // Interpreter
//! assert_eq!(f.eval(&[2.0, 5.0]).unwrap(), 11.0);
//!
//! // In-process native code
//! let mut jit = f.jit().unwrap();
//! assert_eq!(jit.eval(&[2.0, 5.0]).unwrap(), 11.0);
//!
//! // Generated source for an external toolchain
//! assert!(f.source().text.contains("double eval(const double* x, double* a)"));
//! ```

pub use formula::Formula;
pub use graph::{Expr, Graph, Placeholder};

pub mod prelude {
    pub use crate::codegen::{GeneratedCode, Language};
    pub use crate::config::{CompileOptions, ToolchainConfig};
    pub use crate::formula::Formula;
    pub use crate::graph::{Expr, Graph, Placeholder};
    pub use crate::inputs::{Inputs, Scalar};
    pub use crate::jit::JitFunction;
    pub use crate::loader::{CompiledFunction, Evaluator};
    pub use crate::node::{Function, NodeIndex, Operation};
}

/// Code generators and the traversal they share
pub mod codegen;
/// Toolchain and build options
pub mod config;
/// Conversion from parsed expressions to graph nodes
pub mod convert;
/// Error types for the various failure modes
pub mod errors;
/// String expressions
pub mod formula;
/// Recording handles and operator overloading
pub mod graph;
/// Direct and recording inputs
pub mod inputs;
/// Reference evaluator
pub mod interpreter;
/// In-process compilation using Cranelift
pub mod jit;
/// Building and loading native libraries
pub mod loader;
/// Node records and their encoding
pub mod node;
/// Node table
pub mod store;
/// External compiler and assembler
pub mod toolchain;
/// Math functions linked into JIT-compiled code
pub(crate) mod operators;
