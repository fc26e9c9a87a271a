//! Traits that let one function definition either compute or record.
//!
//! A function written against [`Inputs`] runs directly when handed a numeric vector and
//! records a graph when handed a [`Placeholder`](crate::graph::Placeholder):
//!
//! ```rust
//! use fncas::prelude::*;
//!
//! fn f<X: Inputs + ?Sized>(x: &X) -> X::Value {
//!     (x.at(0) + x.at(1)) * x.at(0) - 3.0
//! }
//!
//! // Direct evaluation
//! assert_eq!(f(&[2.0, 5.0][..]), 11.0);
//!
//! // Recording
//! let graph = Graph::new();
//! let root = f(&graph.placeholder(2));
//! assert_eq!(root.eval(&[2.0, 5.0]).unwrap(), 11.0);
//! ```

use std::ops::{Add, Div, Mul, Sub};

use crate::node::Function;

/// A value the recording layer can compute with: `f64` or a graph handle.
pub trait Scalar:
    Copy
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Applies a unary math function.
    fn apply(self, function: Function) -> Self;

    fn sqrt(self) -> Self {
        self.apply(Function::Sqrt)
    }

    fn exp(self) -> Self {
        self.apply(Function::Exp)
    }

    /// Natural logarithm.
    fn ln(self) -> Self {
        self.apply(Function::Log)
    }

    fn sin(self) -> Self {
        self.apply(Function::Sin)
    }

    fn cos(self) -> Self {
        self.apply(Function::Cos)
    }

    fn tan(self) -> Self {
        self.apply(Function::Tan)
    }

    fn asin(self) -> Self {
        self.apply(Function::Asin)
    }

    fn acos(self) -> Self {
        self.apply(Function::Acos)
    }

    fn atan(self) -> Self {
        self.apply(Function::Atan)
    }
}

impl Scalar for f64 {
    fn apply(self, function: Function) -> Self {
        function.apply(self)
    }
}

/// The argument vector of a user function.
pub trait Inputs {
    type Value: Scalar;

    /// Number of addressable inputs.
    fn dim(&self) -> usize;

    /// Input `i`.
    ///
    /// # Panics
    /// Panics if `i >= self.dim()`.
    fn at(&self, i: usize) -> Self::Value;

    /// Lifts a literal into the value type.
    fn constant(&self, value: f64) -> Self::Value;
}

impl Inputs for [f64] {
    type Value = f64;

    fn dim(&self) -> usize {
        self.len()
    }

    fn at(&self, i: usize) -> f64 {
        self[i]
    }

    fn constant(&self, value: f64) -> f64 {
        value
    }
}

impl Inputs for Vec<f64> {
    type Value = f64;

    fn dim(&self) -> usize {
        self.len()
    }

    fn at(&self, i: usize) -> f64 {
        self[i]
    }

    fn constant(&self, value: f64) -> f64 {
        value
    }
}

impl<const N: usize> Inputs for [f64; N] {
    type Value = f64;

    fn dim(&self) -> usize {
        N
    }

    fn at(&self, i: usize) -> f64 {
        self[i]
    }

    fn constant(&self, value: f64) -> f64 {
        value
    }
}

/// Direct evaluation over ndarray's `Array1<f64>`.
#[cfg(feature = "ndarray")]
impl Inputs for ndarray::Array1<f64> {
    type Value = f64;

    fn dim(&self) -> usize {
        self.len()
    }

    fn at(&self, i: usize) -> f64 {
        self[i]
    }

    fn constant(&self, value: f64) -> f64 {
        value
    }
}

/// Direct evaluation over nalgebra's `DVector<f64>`.
#[cfg(feature = "nalgebra")]
impl Inputs for nalgebra::DVector<f64> {
    type Value = f64;

    fn dim(&self) -> usize {
        self.len()
    }

    fn at(&self, i: usize) -> f64 {
        self[i]
    }

    fn constant(&self, value: f64) -> f64 {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f<X: Inputs + ?Sized>(x: &X) -> X::Value {
        (x.at(0) * x.at(1) + x.constant(1.0)).sqrt() / 2.0
    }

    #[test]
    fn test_direct_evaluation() {
        assert_eq!(f(&[3.0, 5.0][..]), 2.0);
        assert_eq!(f(&vec![3.0, 5.0]), 2.0);
        assert_eq!(f(&[3.0, 5.0]), 2.0);
    }

    #[test]
    fn test_scalar_functions_match_std() {
        let x = 0.3f64;
        assert_eq!(Scalar::ln(x), x.ln());
        assert_eq!(Scalar::atan(x), x.atan());
        assert_eq!(Scalar::acos(x), x.acos());
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        let _ = [1.0].at(1);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray_inputs() {
        let x = ndarray::Array1::from_vec(vec![3.0, 5.0]);
        assert_eq!(f(&x), 2.0);
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_nalgebra_inputs() {
        let x = nalgebra::DVector::from_vec(vec![3.0, 5.0]);
        assert_eq!(f(&x), 2.0);
    }
}
