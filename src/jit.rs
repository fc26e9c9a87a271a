//! In-process native compilation with Cranelift.
//!
//! The JIT backend walks the same post-order schedule as the C and assembly generators and
//! produces a function with the same contract:
//!
//! ```text
//! extern "C" fn eval(inputs: *const f64, scratch: *mut f64) -> f64
//! ```
//!
//! Node `i` stores its value to `scratch[i]`, children are loaded back from their slots,
//! and math functions are calls to the shims in [`operators`](crate::operators). Each
//! [`JitFunction`] owns its module; dropping it releases the executable memory.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_codegen::ir::FuncRef;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use log::debug;

use crate::codegen::{PostOrder, Step};
use crate::errors::{EvalError, JitError};
use crate::loader::{check_lengths, Evaluator};
use crate::node::{NodeIndex, Operation};
use crate::operators;
use crate::store::NodeStore;

type RawEval = unsafe extern "C" fn(*const f64, *mut f64) -> f64;

/// Compiles the subgraph rooted at `root` to machine code.
///
/// # Errors
/// Returns a [`JitError`] if the host is unsupported or Cranelift rejects the function.
///
/// # Panics
/// Panics if `root` is outside the store.
pub fn build_function(store: &NodeStore, root: NodeIndex) -> Result<JitFunction, JitError> {
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa);
    let (dim, input_len) = build_function_body(&mut ctx, &mut module, store, root)?;
    debug!("JIT code\n{}", ctx.func.display());

    let func_id = module
        .declare_function("eval", Linkage::Local, &ctx.func.signature)
        .map_err(|msg| JitError::DeclarationError(msg.to_string()))?;
    module
        .define_function(func_id, &mut ctx)
        .map_err(|msg| JitError::FunctionError(msg.to_string()))?;
    module.clear_context(&mut ctx);
    module
        .finalize_definitions()
        .map_err(JitError::ModuleError)?;

    // SAFETY: the function was built with the `RawEval` signature and the module that owns
    // the code is stored next to the pointer in the returned value.
    let func = unsafe { std::mem::transmute::<*const u8, RawEval>(module.get_finalized_function(func_id)) };

    Ok(JitFunction {
        module: Some(module),
        func,
        dim,
        input_len,
        scratch: vec![0.0; dim],
    })
}

/// Renders the Cranelift IR generated for `root` without compiling it.
pub fn clif_ir(store: &NodeStore, root: NodeIndex) -> Result<String, JitError> {
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa);
    build_function_body(&mut ctx, &mut module, store, root)?;
    Ok(ctx.func.display().to_string())
}

/// Creates an Instruction Set Architecture (ISA) target for the host machine.
///
/// `cranelift-jit` places code and the math shims at absolute addresses, so the ISA is
/// always built with `is_pic=false` and non-colocated libcalls.
///
/// # Returns
/// The host ISA with optimization and (in debug builds) the IR verifier enabled.
///
/// # Errors
/// Returns a [`JitError`] if the host architecture is not supported or a flag is rejected.
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, JitError> {
    let mut flag_builder = settings::builder();

    for (name, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", "speed"),
        ("enable_verifier", if cfg!(debug_assertions) { "true" } else { "false" }),
    ] {
        flag_builder
            .set(name, value)
            .map_err(|e| JitError::Setting(format!("{name}={value}: {e}")))?;
    }

    let target_triple = target_lexicon::Triple::host();
    debug!("creating JIT target for {target_triple}");
    let isa_builder = cranelift_native::builder()
        .map_err(|msg| JitError::HostMachineNotSupported(format!("{target_triple}: {msg}")))?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(JitError::CodegenError)
}

/// Creates a JIT module with the math shims registered and a context whose signature is
/// `(inputs: ptr, scratch: ptr) -> f64`.
pub(crate) fn create_module_and_context(isa: Arc<dyn TargetIsa>) -> (JITModule, Context) {
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    operators::register_symbols(&mut builder);

    let module = JITModule::new(builder);
    let mut ctx = module.make_context();

    let pointer = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(pointer));
    sig.params.push(AbiParam::new(pointer));
    sig.returns.push(AbiParam::new(types::F64));
    ctx.func.signature = sig;

    (module, ctx)
}

/// Emits the evaluation schedule into `ctx` and returns `(dim, input_len)`.
fn build_function_body(
    ctx: &mut Context,
    module: &mut dyn Module,
    store: &NodeStore,
    root: NodeIndex,
) -> Result<(usize, usize), JitError> {
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let inputs = builder.block_params(entry_block)[0];
    let scratch = builder.block_params(entry_block)[1];

    let mut imports: HashMap<_, FuncRef> = HashMap::new();
    let mut walk = PostOrder::new(store, root);
    for step in walk.by_ref() {
        let value = match step {
            Step::Load { slot, .. } => load(&mut builder, inputs, slot),
            Step::Constant { value, .. } => builder.ins().f64const(value),
            Step::Operation { op, lhs, rhs, .. } => {
                let lhs = load(&mut builder, scratch, lhs.get());
                let rhs = load(&mut builder, scratch, rhs.get());
                match op {
                    Operation::Add => builder.ins().fadd(lhs, rhs),
                    Operation::Subtract => builder.ins().fsub(lhs, rhs),
                    Operation::Multiply => builder.ins().fmul(lhs, rhs),
                    Operation::Divide => builder.ins().fdiv(lhs, rhs),
                }
            }
            Step::Function {
                function, argument, ..
            } => {
                let func = match imports.entry(function) {
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => {
                        let func_id = operators::link_function(module, function)
                            .map_err(JitError::DeclarationError)?;
                        *entry.insert(module.declare_func_in_func(func_id, builder.func))
                    }
                };
                let arg = load(&mut builder, scratch, argument.get());
                operators::call_function(&mut builder, func, arg)
            }
        };
        store_slot(&mut builder, scratch, step.index().get(), value);
    }

    let result = load(&mut builder, scratch, root.get());
    builder.ins().return_(&[result]);
    builder.finalize();

    Ok((walk.dim(), walk.input_len()))
}

/// Base and displacement of element `slot` of an `f64` array.
fn element(builder: &mut FunctionBuilder, base: Value, slot: u32) -> (Value, Offset32) {
    let bytes = i64::from(slot) * 8;
    match i32::try_from(bytes) {
        Ok(offset) => (base, Offset32::new(offset)),
        Err(_) => (builder.ins().iadd_imm(base, bytes), Offset32::new(0)),
    }
}

fn load(builder: &mut FunctionBuilder, base: Value, slot: u32) -> Value {
    let (base, offset) = element(builder, base, slot);
    builder.ins().load(types::F64, MemFlags::trusted(), base, offset)
}

fn store_slot(builder: &mut FunctionBuilder, base: Value, slot: u32, value: Value) {
    let (base, offset) = element(builder, base, slot);
    builder.ins().store(MemFlags::trusted(), value, base, offset);
}

/// A JIT-compiled evaluation routine together with the module that owns its code.
///
/// Not `Clone`: the machine code is released when the value is dropped.
pub struct JitFunction {
    module: Option<JITModule>,
    func: RawEval,
    dim: usize,
    input_len: usize,
    scratch: Vec<f64>,
}

impl JitFunction {
    /// Scratch slots the routine writes.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Minimum input vector length.
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Evaluates using the function's own scratch buffer.
    pub fn eval(&mut self, inputs: &[f64]) -> Result<f64, EvalError> {
        check_lengths(inputs, self.input_len, &self.scratch, self.dim)?;
        // SAFETY: both buffers were checked against the lengths the routine touches.
        Ok(unsafe { (self.func)(inputs.as_ptr(), self.scratch.as_mut_ptr()) })
    }

    /// Evaluates using a caller-supplied scratch buffer of at least [`dim`](Self::dim)
    /// slots, so one function can serve several threads.
    pub fn eval_with_scratch(&self, inputs: &[f64], scratch: &mut [f64]) -> Result<f64, EvalError> {
        check_lengths(inputs, self.input_len, scratch, self.dim)?;
        // SAFETY: as above.
        Ok(unsafe { (self.func)(inputs.as_ptr(), scratch.as_mut_ptr()) })
    }
}

impl Evaluator for JitFunction {
    fn dim(&self) -> usize {
        self.dim
    }

    fn input_len(&self) -> usize {
        self.input_len
    }

    fn eval(&mut self, inputs: &[f64]) -> Result<f64, EvalError> {
        JitFunction::eval(self, inputs)
    }

    fn eval_with_scratch(&self, inputs: &[f64], scratch: &mut [f64]) -> Result<f64, EvalError> {
        JitFunction::eval_with_scratch(self, inputs, scratch)
    }
}

impl Drop for JitFunction {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `func` is the only pointer into this module and dies with `self`.
            unsafe {
                module.free_memory();
            }
        }
    }
}

impl std::fmt::Debug for JitFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitFunction")
            .field("dim", &self.dim)
            .field("input_len", &self.input_len)
            .finish_non_exhaustive()
    }
}
