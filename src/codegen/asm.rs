//! x86-64 assembly backend (NASM syntax, System V calling convention, ELF64).
//!
//! Register use in `eval`:
//!
//! - `rbx`: input pointer (copied from `rdi`)
//! - `r12`: scratch pointer (copied from `rsi`)
//! - `xmm0`, `xmm1`: operands
//!
//! Both pointers live in callee-saved registers so they survive libm calls, and the
//! prologue leaves the stack 16-byte aligned for those calls. Math functions are imported
//! by symbol and called through the PLT; the dynamic linker resolves them when the
//! library is loaded.

use std::collections::BTreeSet;
use std::fmt::{self, Write};

use itertools::Itertools;

use super::source::c_literal;
use super::{GeneratedCode, Language, PostOrder, Step};
use crate::node::{NodeIndex, Operation};
use crate::store::NodeStore;

/// Largest byte displacement encodable in a memory operand.
const MAX_DISPLACEMENT: u64 = i32::MAX as u64;

/// Emits NASM source evaluating `root`.
///
/// # Arguments
/// * `store` - Node table holding the recorded function
/// * `root` - Node whose value `eval` returns
///
/// # Returns
/// The assembly listing, with an `extern` line for exactly the math functions it calls.
///
/// # Panics
/// Panics if a node index or variable slot is too large to address with a 32-bit
/// displacement (more than 268 million nodes).
pub fn generate(store: &NodeStore, root: NodeIndex) -> GeneratedCode {
    let mut walk = PostOrder::new(store, root);
    let mut body = String::new();
    let mut imports = BTreeSet::new();
    write_body(&mut body, &mut walk, &mut imports).expect("writing to a String cannot fail");

    let dim = walk.dim();
    let mut text = String::new();
    write_listing(&mut text, &body, &imports, root, dim).expect("writing to a String cannot fail");

    GeneratedCode {
        language: Language::Nasm,
        text,
        dim,
        input_len: walk.input_len(),
    }
}

fn write_body(
    out: &mut String,
    walk: &mut PostOrder<'_>,
    imports: &mut BTreeSet<&'static str>,
) -> fmt::Result {
    for step in walk {
        match step {
            Step::Load { index, slot } => writeln!(
                out,
                "  ; a[{index}] = x[{slot}]\n  mov rax, [rbx+{}]\n  mov [r12+{}], rax",
                offset(slot),
                offset(index.get())
            )?,
            Step::Constant { index, value } => writeln!(
                out,
                "  ; a[{index}] = {}\n  mov rax, 0x{:016x}\n  mov [r12+{}], rax",
                c_literal(value),
                value.to_bits(),
                offset(index.get())
            )?,
            Step::Operation { index, op, lhs, rhs } => writeln!(
                out,
                "  ; a[{index}] = a[{lhs}] {} a[{rhs}]\n  movsd xmm0, [r12+{}]\n  movsd xmm1, [r12+{}]\n  {} xmm0, xmm1\n  movsd [r12+{}], xmm0",
                op.symbol(),
                offset(lhs.get()),
                offset(rhs.get()),
                instruction(op),
                offset(index.get())
            )?,
            Step::Function {
                index,
                function,
                argument,
            } => {
                imports.insert(function.name());
                writeln!(
                    out,
                    "  ; a[{index}] = {name}(a[{argument}])\n  movsd xmm0, [r12+{}]\n  call {name} wrt ..plt\n  movsd [r12+{}], xmm0",
                    offset(argument.get()),
                    offset(index.get()),
                    name = function.name(),
                )?
            }
        }
    }
    Ok(())
}

fn write_listing(
    out: &mut String,
    body: &str,
    imports: &BTreeSet<&'static str>,
    root: NodeIndex,
    dim: usize,
) -> fmt::Result {
    out.push_str("[bits 64]\ndefault rel\n\n");
    out.push_str("global eval:function\nglobal dim:function\n");
    if !imports.is_empty() {
        writeln!(out, "extern {}", imports.iter().join(", "))?;
    }
    out.push_str("\nsection .text\n\n");
    out.push_str("eval:\n  push rbx\n  push r12\n  sub rsp, 8\n  mov rbx, rdi\n  mov r12, rsi\n");
    out.push_str(body);
    writeln!(
        out,
        "  ; return a[{root}]\n  movsd xmm0, [r12+{}]\n  add rsp, 8\n  pop r12\n  pop rbx\n  ret",
        offset(root.get())
    )?;
    writeln!(out, "\ndim:\n  mov eax, {dim}\n  ret")?;
    out.push_str("\nsection .note.GNU-stack noalloc noexec nowrite progbits\n");
    Ok(())
}

fn offset(index: u32) -> u64 {
    let bytes = u64::from(index) * 8;
    assert!(
        bytes <= MAX_DISPLACEMENT,
        "index {index} exceeds the 32-bit displacement range of the assembly backend"
    );
    bytes
}

fn instruction(op: Operation) -> &'static str {
    match op {
        Operation::Add => "addsd",
        Operation::Subtract => "subsd",
        Operation::Multiply => "mulsd",
        Operation::Divide => "divsd",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::inputs::{Inputs, Scalar};

    #[test]
    fn test_scenario_assembly() {
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let f = (x.at(0) + x.at(1)) * x.at(0) - 3.0;
        let code = f.assembly();

        assert_eq!(code.language, Language::Nasm);
        assert_eq!(code.dim, 7);
        assert!(code.text.contains("global eval:function\nglobal dim:function\n"));
        assert!(!code.text.contains("extern"));
        assert!(code.text.contains("  mov rax, [rbx+8]\n  mov [r12+8], rax\n"));
        assert!(code.text.contains("  ; a[5] = 0x1.8p+1\n  mov rax, 0x4008000000000000\n"));
        assert!(code.text.contains("  mulsd xmm0, xmm1\n  movsd [r12+32], xmm0\n"));
        assert!(code.text.contains("  subsd xmm0, xmm1\n  movsd [r12+48], xmm0\n"));
        assert!(code.text.contains("dim:\n  mov eax, 7\n  ret\n"));
    }

    #[test]
    fn test_function_imports() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let f = x.at(0).sin() / x.at(0).cos() + x.at(0).sin();
        let code = f.assembly();
        assert!(code.text.contains("extern cos, sin\n"));
        assert!(code.text.contains("  call sin wrt ..plt\n"));
        assert_eq!(code.text.matches("call sin").count(), 2);
    }

    #[test]
    fn test_stack_stays_aligned() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let code = x.at(0).exp().assembly();
        let pushes = code.text.matches("\n  push ").count();
        let pops = code.text.matches("\n  pop ").count();
        assert_eq!(pushes, 2);
        assert_eq!(pops, 2);
        assert!(code.text.contains("  sub rsp, 8\n"));
        assert!(code.text.contains("  add rsp, 8\n"));
    }

    #[test]
    fn test_division_instruction() {
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let code = (x.at(0) / x.at(1)).assembly();
        assert!(code.text.contains("  divsd xmm0, xmm1\n"));
    }
}
