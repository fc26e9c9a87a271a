//! Expression Evaluation Benchmarks
//!
//! Each test function is written once against `Inputs` and then evaluated
//!
//! - **Direct**: on `f64` inputs, i.e. plain Rust arithmetic
//! - **Interpreter**: by walking the recorded graph
//! - **JIT**: through Cranelift-compiled machine code
//! - **C**: through a library built by the system C compiler (skipped if `cc` is missing)
//!
//! A second group measures the one-time cost of JIT compilation.
//!
//! Run with: `cargo bench --bench expressions`

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fncas::prelude::*;

fn linear<X: Inputs + ?Sized>(x: &X) -> X::Value {
    x.at(0) * 2.2 + 1.1
}

fn polynomial<X: Inputs + ?Sized>(x: &X) -> X::Value {
    let a = x.at(0);
    let b = x.at(1);
    (a * a * a + a * a * 2.0 - a * 5.0 + 1.0) / (b * b + b * 3.0 + 2.0)
}

fn nested<X: Inputs + ?Sized>(x: &X) -> X::Value {
    let (a, b, c) = (x.at(0), x.at(1), x.at(2));
    ((a + b) * (a - b)) / ((c + 1.0) * (c - 1.0))
}

fn transcendental<X: Inputs + ?Sized>(x: &X) -> X::Value {
    let (a, b, c) = (x.at(0), x.at(1), x.at(2));
    (a * b * c).sqrt() + (a / b).sin() * c.cos() - (a + b + c).ln() + (c * 0.1).atan()
}

type TestFunction = fn(&[f64]) -> f64;
type RecordFunction = for<'g> fn(&Placeholder<'g>) -> Expr<'g>;

fn test_cases() -> [(&'static str, usize, TestFunction, RecordFunction); 4] {
    let cases: [(&'static str, usize, TestFunction, RecordFunction); 4] = [
        ("linear", 1, |x| linear(x), |x| linear(x)),
        ("polynomial", 2, |x| polynomial(x), |x| polynomial(x)),
        ("nested", 3, |x| nested(x), |x| nested(x)),
        ("transcendental", 3, |x| transcendental(x), |x| transcendental(x)),
    ];
    cases
}

fn benchmark_expressions(c: &mut Criterion) {
    let params = [2.5, 1.8, 0.7];
    let c_options = CompileOptions::new(Language::C);
    let have_cc = c_options.toolchain.supports(Language::C);

    let mut group = c.benchmark_group("Expression Evaluation");

    for (name, dim, direct, record) in test_cases() {
        let graph = Graph::new();
        let root = record(&graph.placeholder(dim));
        let inputs = &params[..dim];

        group.bench_with_input(BenchmarkId::new("Direct", name), inputs, |b, inputs| {
            b.iter(|| black_box(direct(black_box(inputs))))
        });

        group.bench_with_input(BenchmarkId::new("Interpreter", name), inputs, |b, inputs| {
            b.iter(|| black_box(root.eval(black_box(inputs)).unwrap()))
        });

        let mut jit = root.jit().expect("Failed to JIT compile");
        group.bench_with_input(BenchmarkId::new("JIT", name), inputs, |b, inputs| {
            b.iter(|| black_box(jit.eval(black_box(inputs)).unwrap()))
        });

        if have_cc {
            let mut native = root.compile(&c_options).expect("Failed to build C library");
            group.bench_with_input(BenchmarkId::new("C", name), inputs, |b, inputs| {
                b.iter(|| black_box(native.eval(black_box(inputs)).unwrap()))
            });
        }
    }

    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let expressions = [
        "2.2 * a + 1.1",
        "(a^3 + 2*a^2 - 5*a + 1) / (b^2 + 3*b + 2)",
        "((a + b) * (a - b)) / ((c + 1) * (c - 1))",
        "sqrt(a*b*c) + sin(a/b) * cos(c) - ln(a+b+c) + atan(c*0.1)",
    ];

    let mut group = c.benchmark_group("Compilation Time");

    for (i, expr) in expressions.iter().enumerate() {
        group.bench_with_input(
            BenchmarkId::new("JIT", format!("expr_{}", i)),
            expr,
            |b, expr| {
                b.iter(|| {
                    // parse -> record -> JIT compile
                    let formula = Formula::new(*expr).unwrap();
                    black_box(formula.jit().unwrap())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_expressions, benchmark_compilation_time);
criterion_main!(benches);
