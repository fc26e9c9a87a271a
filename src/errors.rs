//! Error types for the fncas crate.
//!
//! Malformed graphs and misuse of the node accessors are programming errors and panic.
//! The enums below cover everything that can legitimately fail at runtime:
//!
//! - `EvalError`: an input vector or scratch buffer that is too short
//! - `DecodeError`: a serialized node table that cannot be restored
//! - `ToolchainError`: the external compiler/assembler could not produce a library
//! - `LoadError`: the produced library could not be opened or lacks an entry point
//! - `CompileError`: any failure of the generate → build → load pipeline
//! - `JitError`: errors during in-process compilation with Cranelift
//! - `ConvertError` / `FormulaError`: failures of the string front-end
//!
//! Division by zero and out-of-domain math arguments are not errors; they produce IEEE 754
//! infinities and NaNs in every backend.

use std::path::PathBuf;

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

/// Errors raised while evaluating a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    /// A variable refers to a slot past the end of the input vector
    #[error("variable slot {slot} is out of range for an input vector of length {len}")]
    InputTooShort { slot: u32, len: usize },
    /// A compiled function needs more inputs than were supplied
    #[error("invalid input length: expected at least {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// A caller-supplied scratch buffer is smaller than `dim()`
    #[error("scratch buffer too small: expected at least {expected}, got {got}")]
    ScratchTooSmall { expected: usize, got: usize },
}

/// Errors raised when restoring a serialized node table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{len} bytes is not a whole number of {record_size} byte records")]
    TruncatedRecord { len: usize, record_size: usize },
    #[error("node {index} references node {child}, which does not precede it")]
    ForwardReference { index: u32, child: u32 },
    #[error("{0} records exceed the 32-bit index space")]
    TooManyRecords(usize),
}

/// Errors raised by the external toolchain.
#[derive(Error, Debug)]
pub enum ToolchainError {
    /// The executable could not be found or started
    #[error("tool not found: {0}")]
    ToolMissing(String),
    /// The executable ran and reported failure
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
    /// The executable reported success but did not produce the expected file
    #[error("toolchain did not produce {0}")]
    MissingOutput(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when loading a built library.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not load {path}: {source}")]
    Open {
        path: PathBuf,
        source: libloading::Error,
    },
    #[error("library {path} does not export `{symbol}`: {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        source: libloading::Error,
    },
}

/// Errors raised by [`compile`](crate::loader::compile).
#[derive(Error, Debug)]
pub enum CompileError {
    /// Writing the generated code or creating the work directory failed
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to build native library")]
    Toolchain(#[from] ToolchainError),
    #[error("failed to load native library")]
    Load(#[from] LoadError),
}

/// Errors that can occur during JIT compilation with Cranelift.
#[derive(Error, Debug)]
pub enum JitError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid setting: {0}")]
    Setting(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or an imported math symbol
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// Errors that can occur while lowering an evalexpr tree into the graph.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when an exponent is not an integer constant
    #[error("Could not convert exponent in Exp operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a variable is not found in the variable map
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

/// High-level errors of the [`Formula`](crate::formula::Formula) front-end.
#[derive(Debug, Error)]
pub enum FormulaError {
    /// Error when parsing the expression string with evalexpr
    #[error("Failed to parse expression")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when lowering the parsed expression into the graph
    #[error("Failed to record expression")]
    Convert(#[from] ConvertError),
    /// Error when a variable of the expression is missing from the variable map
    #[error("Variable not found in formula: {0}")]
    VariableNotFound(String),
    #[error("Failed to evaluate formula")]
    Eval(#[from] EvalError),
    #[error("Failed to compile formula")]
    Compile(#[from] CompileError),
    #[error("Failed to JIT compile formula")]
    Jit(#[from] JitError),
}
