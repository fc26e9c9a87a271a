//! String front-end.
//!
//! A [`Formula`] parses an expression with evalexpr, records it into its own [`Graph`] and
//! exposes every backend for the recorded root.
//!
//! # Example
//!
//! ```
//! use fncas::Formula;
//!
//! let formula = Formula::new("(x + y) * x - 3").unwrap();
//! assert_eq!(formula.variables(), ["x", "y"]);
//! assert_eq!(formula.eval(&[2.0, 5.0]).unwrap(), 11.0);
//! ```
//!
//! # Variable Handling
//!
//! Variables can be specified either:
//! - Automatically extracted and sorted alphabetically using `new()`
//! - Explicitly mapped to input slots using `from_var_map()`
//!
//! Input arrays must match the variable ordering.

use std::collections::{HashMap, HashSet};

use colored::Colorize;
use evalexpr::{build_operator_tree, DefaultNumericTypes, Node};
use itertools::Itertools;

use crate::codegen::{GeneratedCode, Language};
use crate::config::CompileOptions;
use crate::convert::{extract_symbols, record};
use crate::errors::{EvalError, FormulaError};
use crate::graph::{Expr, Graph};
use crate::jit::{self, JitFunction};
use crate::loader::CompiledFunction;
use crate::node::NodeIndex;

/// A parsed and recorded expression.
pub struct Formula {
    text: String,
    graph: Graph,
    root: NodeIndex,
    var_map: HashMap<String, u32>,
    sorted_variables: Vec<String>,
}

impl std::fmt::Debug for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Formula")
            .field("text", &self.text)
            .field("root", &self.root)
            .field("nodes", &self.graph.len())
            .field("variables", &self.sorted_variables)
            .finish()
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{")?;
        writeln!(f, "    {}: {}", "Formula".cyan(), self.text)?;
        writeln!(f, "    {}: {}", "Recorded".cyan(), self.expr())?;
        writeln!(f, "    {}: {:?}", "Variables".cyan(), self.sorted_variables)?;
        writeln!(f, "    {}: {}", "Nodes".cyan(), self.graph.len())?;
        writeln!(f, "}}")
    }
}

impl Formula {
    /// Parses `text` and assigns input slots to its variables in alphabetical order.
    ///
    /// For more control over variable ordering, use `from_var_map()` instead.
    ///
    /// # Arguments
    /// * `text` - Expression in evalexpr syntax, e.g. `"2*x + sin(y)"`
    ///
    /// # Errors
    /// Returns [`FormulaError::Parse`] for malformed text and [`FormulaError::Convert`] for
    /// operators or functions the graph cannot record.
    pub fn new(text: impl Into<String>) -> Result<Self, FormulaError> {
        let text = text.into();
        let node = build_operator_tree::<DefaultNumericTypes>(&text)?;
        let variables = extract_symbols(&node);
        Self::build(&variables, text, &node)
    }

    /// Parses `text` with an explicit variable-to-slot mapping.
    ///
    /// # Arguments
    /// * `text` - Expression in evalexpr syntax
    /// * `variables` - Input slot of every variable; slots may leave gaps
    ///
    /// # Errors
    /// Returns [`FormulaError::VariableNotFound`] listing, sorted and comma separated, every
    /// variable of `text` missing from `variables`.
    ///
    /// ```
    /// # use fncas::Formula;
    /// # use std::collections::HashMap;
    /// let vars = HashMap::from([("y".to_string(), 0), ("x".to_string(), 1)]);
    /// let formula = Formula::from_var_map("2*x + y^2", &vars).unwrap();
    /// assert_eq!(formula.eval(&[2.0, 1.0]).unwrap(), 6.0);
    /// ```
    pub fn from_var_map(
        text: impl Into<String>,
        variables: &HashMap<String, u32>,
    ) -> Result<Self, FormulaError> {
        let text = text.into();
        let node = build_operator_tree::<DefaultNumericTypes>(&text)?;
        Self::build(variables, text, &node)
    }

    fn build(
        variables: &HashMap<String, u32>,
        text: String,
        node: &Node,
    ) -> Result<Self, FormulaError> {
        // Validate if the variables are in the formula
        let non_defined_variables: HashSet<String> = extract_symbols(node)
            .into_keys()
            .filter(|variable| !variables.contains_key(variable))
            .collect();
        if !non_defined_variables.is_empty() {
            return Err(FormulaError::VariableNotFound(
                non_defined_variables.into_iter().sorted().join(", "),
            ));
        }

        let sorted_variables: Vec<String> = variables
            .iter()
            .sorted_by_key(|(_, &idx)| idx)
            .map(|(var, _)| var.clone())
            .collect();

        let graph = Graph::new();
        let root = record(&graph, node, variables)?.index();

        Ok(Self {
            text,
            graph,
            root,
            var_map: variables.clone(),
            sorted_variables,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Variable names in slot order.
    pub fn variables(&self) -> &[String] {
        &self.sorted_variables
    }

    pub fn var_map(&self) -> &HashMap<String, u32> {
        &self.var_map
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    pub fn expr(&self) -> Expr<'_> {
        self.graph.expr(self.root)
    }

    /// Number of input values `eval` expects.
    pub fn arity(&self) -> usize {
        self.var_map
            .values()
            .max()
            .map_or(0, |&slot| slot as usize + 1)
    }

    /// Interprets the formula.
    ///
    /// # Errors
    /// Returns [`EvalError::InvalidInputLength`] if `values` does not have one entry per
    /// input slot.
    pub fn eval(&self, values: &[f64]) -> Result<f64, FormulaError> {
        self.validate_input_length(values)?;
        Ok(self.graph.evaluate(self.root, values)?)
    }

    /// C translation unit exporting `eval` and `dim` for this formula.
    ///
    /// # Returns
    /// The source text plus the scratch size and input length the routine expects.
    pub fn source(&self) -> GeneratedCode {
        self.graph.generate(self.root, Language::C)
    }

    pub fn assembly(&self) -> GeneratedCode {
        self.graph.generate(self.root, Language::Nasm)
    }

    /// Cranelift IR of the JIT backend.
    pub fn clif(&self) -> Result<String, FormulaError> {
        Ok(jit::clif_ir(&self.graph.store(), self.root)?)
    }

    /// Builds and loads a native library.
    ///
    /// # Arguments
    /// * `options` - Target language, toolchain and artifact handling
    ///
    /// # Errors
    /// Returns [`FormulaError::Compile`] if the toolchain is missing or fails, or the built
    /// library cannot be loaded.
    pub fn compile(&self, options: &CompileOptions) -> Result<CompiledFunction, FormulaError> {
        Ok(self.graph.compile(self.root, options)?)
    }

    /// Compiles the formula in-process with Cranelift.
    ///
    /// # Errors
    /// Returns [`FormulaError::Jit`] if the host is unsupported or code generation fails.
    pub fn jit(&self) -> Result<JitFunction, FormulaError> {
        Ok(self.graph.jit(self.root)?)
    }

    fn validate_input_length(&self, values: &[f64]) -> Result<(), EvalError> {
        let expected = self.arity();
        if values.len() != expected {
            return Err(EvalError::InvalidInputLength {
                expected,
                got: values.len(),
            });
        }
        Ok(())
    }
}
