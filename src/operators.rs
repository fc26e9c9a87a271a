//! Math-library functions for JIT-compiled code.
//!
//! Every [`Function`] is exposed to Cranelift under its C math library name and bound to an
//! `extern "C"` shim. The shims forward to the `f64` methods, which lower to the same libm
//! routines the C and assembly backends link against.
//!
//! - `register_symbols` binds the names when the JIT module is created
//! - `link_function` declares one function as an import of the module
//! - `call_function` emits the call inside a function being built

use cranelift::prelude::FunctionBuilder;
use cranelift_codegen::ir::types::F64;
use cranelift_codegen::ir::{AbiParam, FuncRef, InstBuilder, Value};
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::node::Function;

extern "C" fn sqrt(x: f64) -> f64 {
    x.sqrt()
}

extern "C" fn exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn log(x: f64) -> f64 {
    x.ln()
}

extern "C" fn sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn asin(x: f64) -> f64 {
    x.asin()
}

extern "C" fn acos(x: f64) -> f64 {
    x.acos()
}

extern "C" fn atan(x: f64) -> f64 {
    x.atan()
}

/// Address of the shim implementing `function`.
pub(crate) fn address(function: Function) -> *const u8 {
    let shim: extern "C" fn(f64) -> f64 = match function {
        Function::Sqrt => sqrt,
        Function::Exp => exp,
        Function::Log => log,
        Function::Sin => sin,
        Function::Cos => cos,
        Function::Tan => tan,
        Function::Asin => asin,
        Function::Acos => acos,
        Function::Atan => atan,
    };
    shim as *const u8
}

/// Binds every math function name to its shim.
pub(crate) fn register_symbols(builder: &mut JITBuilder) {
    for function in Function::ALL {
        builder.symbol(function.name(), address(function));
    }
}

/// Declares `function` as an imported `f64 -> f64` symbol of the module.
pub(crate) fn link_function(module: &mut dyn Module, function: Function) -> Result<FuncId, String> {
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(F64));
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(function.name(), Linkage::Import, &sig)
        .map_err(|e| e.to_string())
}

/// Emits a call to an imported math function and returns its result.
pub(crate) fn call_function(builder: &mut FunctionBuilder, func: FuncRef, arg: Value) -> Value {
    let call = builder.ins().call(func, &[arg]);
    builder.inst_results(call)[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shims_match_direct_evaluation() {
        for function in Function::ALL {
            let shim: extern "C" fn(f64) -> f64 =
                unsafe { std::mem::transmute(address(function)) };
            for x in [0.25, 0.5, 0.75] {
                assert_eq!(shim(x).to_bits(), function.apply(x).to_bits(), "{}", function.name());
            }
        }
    }

    #[test]
    fn test_log_is_natural_logarithm() {
        let shim: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(address(Function::Log)) };
        assert_eq!(shim(1.0), 0.0);
        assert!(shim(-1.0).is_nan());
    }
}
