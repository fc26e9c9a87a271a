//! Lowering of evalexpr operator trees into a [`Graph`].
//!
//! The main entry point is [`record`], which walks the tree produced by
//! `evalexpr::build_operator_tree` and appends one node per operation to the graph:
//!
//! - `+ - * /` become operation nodes (n-ary sums and products are folded left)
//! - unary minus becomes `-1 * x`
//! - `x^n` with an integer constant `n` becomes repeated multiplication
//! - `sqrt exp ln log sin cos tan asin acos atan`, with or without the `math::` prefix,
//!   become function nodes
//! - variables become input slots looked up in the variable map

use std::collections::{HashMap, HashSet};

use evalexpr::{Node, Operator};

use crate::errors::ConvertError;
use crate::graph::{Expr, Graph};
use crate::node::{Function, Operation};

/// Records an evalexpr node into `graph` and returns the handle of its root.
///
/// # Errors
/// Returns a [`ConvertError`] for operators, functions or exponents without a graph
/// counterpart, and for variables missing from `var_map`.
pub fn record<'g>(
    graph: &'g Graph,
    node: &Node,
    var_map: &HashMap<String, u32>,
) -> Result<Expr<'g>, ConvertError> {
    match node.operator() {
        Operator::Add => fold(graph, node, Operation::Add, var_map),
        Operator::Mul => fold(graph, node, Operation::Multiply, var_map),
        Operator::Sub => binary(graph, node, Operation::Subtract, var_map),
        Operator::Div => binary(graph, node, Operation::Divide, var_map),
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(graph.constant(*f)),
            evalexpr::Value::Int(i) => Ok(graph.constant(*i as f64)),
            _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            let slot = var_map
                .get(identifier.as_str())
                .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string()))?;
            Ok(graph.variable(*slot))
        }
        Operator::Neg => {
            let operand = record(graph, single_child(node)?, var_map)?;
            Ok(graph.operation(Operation::Multiply, graph.constant(-1.0), operand))
        }
        Operator::FunctionIdentifier { identifier } => {
            let name = identifier.strip_prefix("math::").unwrap_or(identifier);
            let function = match name {
                "ln" => Some(Function::Log),
                other => Function::from_name(other),
            }
            .ok_or_else(|| ConvertError::UnsupportedFunction(identifier.to_string()))?;
            let argument = record(graph, single_child(node)?, var_map)?;
            Ok(graph.function(function, argument))
        }
        // Root node - should have exactly one child
        Operator::RootNode => match node.children() {
            [child] => record(graph, child, var_map),
            children => Err(ConvertError::RootNode(format!("{children:?}"))),
        },
        Operator::Exp => {
            let [base, exponent] = node.children() else {
                return Err(ConvertError::ExpOperator(format!(
                    "expected 2 operands, got {}",
                    node.children().len()
                )));
            };
            let exponent = integer_exponent(exponent)?;
            let base = record(graph, base, var_map)?;
            Ok(power(graph, base, exponent))
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

fn single_child(node: &Node) -> Result<&Node, ConvertError> {
    match node.children() {
        [child] => Ok(child),
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        ))),
    }
}

fn fold<'g>(
    graph: &'g Graph,
    node: &Node,
    op: Operation,
    var_map: &HashMap<String, u32>,
) -> Result<Expr<'g>, ConvertError> {
    let (first, rest) = node.children().split_first().ok_or_else(|| {
        ConvertError::UnsupportedOperator(format!("{:?} without operands", node.operator()))
    })?;
    rest.iter()
        .try_fold(record(graph, first, var_map)?, |acc, child| {
            Ok(graph.operation(op, acc, record(graph, child, var_map)?))
        })
}

fn binary<'g>(
    graph: &'g Graph,
    node: &Node,
    op: Operation,
    var_map: &HashMap<String, u32>,
) -> Result<Expr<'g>, ConvertError> {
    match node.children() {
        [lhs, rhs] => {
            let lhs = record(graph, lhs, var_map)?;
            let rhs = record(graph, rhs, var_map)?;
            Ok(graph.operation(op, lhs, rhs))
        }
        children => Err(ConvertError::UnsupportedOperator(format!(
            "{:?} with {} operands",
            node.operator(),
            children.len()
        ))),
    }
}

/// Reads a (possibly negated, possibly parenthesized) integer constant.
/// Largest exponent magnitude accepted in `x^n`. Powers are recorded as `|n|` nodes, so
/// the bound keeps a short string from requesting an arbitrarily large graph.
pub const MAX_EXPONENT: u64 = 1024;

fn integer_exponent(node: &Node) -> Result<i64, ConvertError> {
    match node.operator() {
        Operator::Const { value } => {
            let exponent = match value {
                evalexpr::Value::Int(i) => Some(*i),
                evalexpr::Value::Float(f) if f.fract() == 0.0 && f.abs() <= MAX_EXPONENT as f64 => {
                    Some(*f as i64)
                }
                evalexpr::Value::Float(f) if f.fract() == 0.0 => Some(i64::MAX),
                _ => None,
            };
            match exponent {
                Some(n) if n.unsigned_abs() <= MAX_EXPONENT => Ok(n),
                Some(_) => Err(ConvertError::ExpOperator(format!(
                    "exponent {value:?} exceeds the limit of {MAX_EXPONENT}"
                ))),
                None => Err(ConvertError::ExpOperator(format!(
                    "expected an integer exponent, got {value:?}"
                ))),
            }
        }
        Operator::Neg | Operator::RootNode => {
            let inner = integer_exponent(single_child(node)?)?;
            Ok(if matches!(node.operator(), Operator::Neg) {
                -inner
            } else {
                inner
            })
        }
        other => Err(ConvertError::ExpOperator(format!(
            "expected a constant exponent, got {other:?}"
        ))),
    }
}

/// `base^exponent` as a chain of multiplications; negative exponents divide into one.
fn power<'g>(graph: &'g Graph, base: Expr<'g>, exponent: i64) -> Expr<'g> {
    let mut product = match exponent.unsigned_abs() {
        0 => return graph.constant(1.0),
        _ => base,
    };
    for _ in 1..exponent.unsigned_abs() {
        product = product * base;
    }
    if exponent < 0 {
        1.0 / product
    } else {
        product
    }
}

/// Collects the variables of an expression and assigns slots in alphabetical order.
pub fn extract_symbols(node: &Node) -> HashMap<String, u32> {
    let mut symbols = HashSet::new();
    extract_symbols_from_node(node, &mut symbols);

    let mut symbols: Vec<String> = symbols.into_iter().collect();
    symbols.sort();

    symbols
        .into_iter()
        .enumerate()
        .map(|(i, v)| (v, i as u32))
        .collect()
}

fn extract_symbols_from_node(node: &Node, symbols: &mut HashSet<String>) {
    match node.operator() {
        Operator::VariableIdentifierRead { identifier } => {
            symbols.insert(identifier.to_string());
        }
        _ => {
            for child in node.children() {
                extract_symbols_from_node(child, symbols);
            }
        }
    }
}
