//! Portable C backend.
//!
//! The generated translation unit exports
//!
//! ```c
//! double eval(const double* x, double* a);
//! int dim(void);
//! ```
//!
//! and depends on nothing but `<math.h>` (plus `<string.h>` when a NaN constant has to be
//! spelled by its bits). It holds no static state, so one loaded library
//! can serve concurrent callers as long as each passes its own scratch array `a`.

use std::fmt::{self, Write};

use super::{GeneratedCode, Language, PostOrder, Step};
use crate::node::NodeIndex;
use crate::store::NodeStore;

/// Reinterprets a bit pattern as a double. Only emitted when a NaN constant is present, so
/// sign and payload survive compilation.
const BITS_HELPER: &str = "\
#include <string.h>

static inline double fncas_bits(unsigned long long u) {
  double d;
  memcpy(&d, &u, sizeof d);
  return d;
}
";

/// Emits C source evaluating `root`.
///
/// # Arguments
/// * `store` - Node table holding the recorded function
/// * `root` - Node whose value `eval` returns
///
/// # Returns
/// The translation unit together with the scratch size and the input length it requires.
///
/// # Panics
/// Panics if `root` is outside the store.
pub fn generate(store: &NodeStore, root: NodeIndex) -> GeneratedCode {
    let mut walk = PostOrder::new(store, root);
    let mut body = String::new();
    let mut needs_bits = false;
    write_body(&mut body, &mut walk, &mut needs_bits).expect("writing to a String cannot fail");

    let dim = walk.dim();
    let mut text = String::new();
    write_unit(&mut text, &body, needs_bits, root, dim).expect("writing to a String cannot fail");

    GeneratedCode {
        language: Language::C,
        text,
        dim,
        input_len: walk.input_len(),
    }
}

fn write_body(out: &mut String, walk: &mut PostOrder<'_>, needs_bits: &mut bool) -> fmt::Result {
    for step in walk {
        match step {
            Step::Load { index, slot } => writeln!(out, "  a[{index}] = x[{slot}];")?,
            Step::Constant { index, value } => {
                *needs_bits |= value.is_nan();
                writeln!(out, "  a[{index}] = {};", c_literal(value))?
            }
            Step::Operation { index, op, lhs, rhs } => {
                writeln!(out, "  a[{index}] = a[{lhs}] {} a[{rhs}];", op.symbol())?
            }
            Step::Function {
                index,
                function,
                argument,
            } => writeln!(out, "  a[{index}] = {}(a[{argument}]);", function.name())?,
        }
    }
    Ok(())
}

fn write_unit(
    out: &mut String,
    body: &str,
    needs_bits: bool,
    root: NodeIndex,
    dim: usize,
) -> fmt::Result {
    writeln!(out, "#include <math.h>")?;
    if needs_bits {
        writeln!(out, "{BITS_HELPER}")?;
    } else {
        writeln!(out)?;
    }
    writeln!(out, "double eval(const double* x, double* a) {{")?;
    out.push_str(body);
    writeln!(out, "  return a[{root}];")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    writeln!(out, "int dim(void) {{ return {dim}; }}")
}

/// Exact C spelling of a double.
///
/// Finite values become C99 hexadecimal literals and infinities use `INFINITY` from
/// `<math.h>`. NaNs are spelled as their bit pattern through `fncas_bits`, which
/// [`generate`] defines whenever it emits one.
pub fn c_literal(value: f64) -> String {
    if value.is_nan() {
        return format!("fncas_bits(0x{:016x}ULL)", value.to_bits());
    }
    if value.is_infinite() {
        return if value > 0.0 { "INFINITY" } else { "-INFINITY" }.to_string();
    }
    hex_float(value)
}

/// Formats a finite double like C's `%a`: `0x1.8p+1` for 3.0.
pub fn hex_float(value: f64) -> String {
    let bits = value.to_bits();
    let sign = if bits >> 63 == 1 { "-" } else { "" };
    let exponent = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & ((1u64 << 52) - 1);

    let digits = format!("{mantissa:013x}");
    let digits = digits.trim_end_matches('0');
    let fraction = if digits.is_empty() {
        String::new()
    } else {
        format!(".{digits}")
    };

    match (exponent, mantissa) {
        (0, 0) => format!("{sign}0x0p+0"),
        (0, _) => format!("{sign}0x0{fraction}p-1022"),
        _ => format!("{sign}0x1{fraction}p{:+}", exponent - 1023),
    }
}
