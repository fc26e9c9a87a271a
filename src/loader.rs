//! Building and loading native evaluation routines.
//!
//! [`compile`] runs the whole pipeline: generate code for a root, write it into a fresh
//! `fncas-*` directory, hand it to a [`Toolchain`], and open the resulting library. The
//! returned [`CompiledFunction`] owns the library and the directory; dropping it unloads
//! the library first and then removes the files (unless artifacts are kept).

use std::ffi::c_int;
use std::fs;
use std::path::{Path, PathBuf};

use libloading::Library;
use log::debug;
use tempfile::TempDir;

use crate::codegen::{self, Language};
use crate::config::CompileOptions;
use crate::errors::{CompileError, EvalError, LoadError};
use crate::node::NodeIndex;
use crate::store::NodeStore;
use crate::toolchain::{CommandToolchain, Toolchain};

type DimFn = unsafe extern "C" fn() -> c_int;
type EvalFn = unsafe extern "C" fn(*const f64, *mut f64) -> f64;

/// Common interface of natively compiled routines.
pub trait Evaluator {
    /// Scratch slots the routine writes.
    fn dim(&self) -> usize;

    /// Minimum input vector length.
    fn input_len(&self) -> usize;

    /// Evaluates with an internal, reused scratch buffer.
    fn eval(&mut self, inputs: &[f64]) -> Result<f64, EvalError>;

    /// Evaluates with a caller-owned scratch buffer of at least `dim()` slots.
    fn eval_with_scratch(&self, inputs: &[f64], scratch: &mut [f64]) -> Result<f64, EvalError>;
}

pub(crate) fn check_lengths(
    inputs: &[f64],
    input_len: usize,
    scratch: &[f64],
    dim: usize,
) -> Result<(), EvalError> {
    if inputs.len() < input_len {
        return Err(EvalError::InvalidInputLength {
            expected: input_len,
            got: inputs.len(),
        });
    }
    if scratch.len() < dim {
        return Err(EvalError::ScratchTooSmall {
            expected: dim,
            got: scratch.len(),
        });
    }
    Ok(())
}

/// Compiles `root` with the system toolchain described by `options`.
pub fn compile(
    store: &NodeStore,
    root: NodeIndex,
    options: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    let toolchain = CommandToolchain::new(options.toolchain.clone());
    compile_with(store, root, options, &toolchain)
}

/// Compiles `root` with a caller-supplied toolchain.
///
/// # Panics
/// Panics if `root` is outside the store.
pub fn compile_with<T: Toolchain + ?Sized>(
    store: &NodeStore,
    root: NodeIndex,
    options: &CompileOptions,
    toolchain: &T,
) -> Result<CompiledFunction, CompileError> {
    let code = codegen::generate(store, root, options.language);
    debug!(
        "generated {} bytes of {} for node {root} (dim {}, inputs {})",
        code.text.len(),
        code.language,
        code.dim,
        code.input_len
    );

    let mut builder = tempfile::Builder::new();
    builder.prefix("fncas-");
    let dir = match &options.work_dir {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };
    let artifacts = if options.keep_artifacts {
        Artifacts::Kept(dir.keep())
    } else {
        Artifacts::Temporary(dir)
    };

    let source = artifacts
        .path()
        .join(format!("expr.{}", options.language.extension()));
    fs::write(&source, &code.text)?;

    let library_path = toolchain.build(&source, options.language)?;
    let loaded = load(&library_path)?;
    debug!("loaded {}", library_path.display());

    // SAFETY: `dim` takes no arguments and has no side effects.
    let reported = unsafe { (loaded.dim)() };
    let dim = usize::try_from(reported).map_or(code.dim, |reported| reported.max(code.dim));

    Ok(CompiledFunction {
        library: loaded.library,
        artifacts,
        library_path,
        dim_fn: loaded.dim,
        eval_fn: loaded.eval,
        language: options.language,
        dim,
        input_len: code.input_len,
        scratch: Vec::new(),
    })
}

struct Loaded {
    library: Library,
    dim: DimFn,
    eval: EvalFn,
}

fn load(path: &Path) -> Result<Loaded, LoadError> {
    // SAFETY: the library was produced from generated code that has no initializers.
    let library = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let missing = |symbol: &'static str| {
        move |source| LoadError::MissingSymbol {
            path: path.to_path_buf(),
            symbol,
            source,
        }
    };

    // SAFETY: the symbol types match the signatures emitted by every generator.
    let (dim, eval) = unsafe {
        let dim: DimFn = *library.get::<DimFn>(b"dim\0").map_err(missing("dim"))?;
        let eval: EvalFn = *library.get::<EvalFn>(b"eval\0").map_err(missing("eval"))?;
        (dim, eval)
    };

    Ok(Loaded { library, dim, eval })
}

enum Artifacts {
    Temporary(TempDir),
    Kept(PathBuf),
}

impl Artifacts {
    fn path(&self) -> &Path {
        match self {
            Artifacts::Temporary(dir) => dir.path(),
            Artifacts::Kept(path) => path,
        }
    }
}

/// A loaded native evaluation routine.
///
/// Owns the shared library and its build directory, so it is move-only. The library is
/// unloaded before the directory is removed.
pub struct CompiledFunction {
    // Field order is drop order.
    #[allow(dead_code)]
    library: Library,
    artifacts: Artifacts,
    library_path: PathBuf,
    dim_fn: DimFn,
    eval_fn: EvalFn,
    language: Language,
    dim: usize,
    input_len: usize,
    scratch: Vec<f64>,
}

impl CompiledFunction {
    /// Scratch slots required, as reported by the library's `dim()`.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }

    /// Directory holding the generated source and the built library.
    pub fn artifacts_dir(&self) -> &Path {
        self.artifacts.path()
    }

    /// Calls the library's `dim()` again.
    pub fn reported_dim(&self) -> i32 {
        // SAFETY: the library is alive for as long as `self`.
        unsafe { (self.dim_fn)() }
    }

    /// Evaluates with the function's own scratch buffer, which grows on first use and is
    /// reused afterwards.
    pub fn eval(&mut self, inputs: &[f64]) -> Result<f64, EvalError> {
        if self.scratch.len() < self.dim {
            self.scratch.resize(self.dim, 0.0);
        }
        check_lengths(inputs, self.input_len, &self.scratch, self.dim)?;
        // SAFETY: buffers are large enough and the library is alive for as long as `self`.
        Ok(unsafe { (self.eval_fn)(inputs.as_ptr(), self.scratch.as_mut_ptr()) })
    }

    /// Evaluates with a caller-owned scratch buffer. The generated routine keeps no state,
    /// so threads may share one function as long as each passes its own buffer.
    pub fn eval_with_scratch(&self, inputs: &[f64], scratch: &mut [f64]) -> Result<f64, EvalError> {
        check_lengths(inputs, self.input_len, scratch, self.dim)?;
        // SAFETY: as above.
        Ok(unsafe { (self.eval_fn)(inputs.as_ptr(), scratch.as_mut_ptr()) })
    }
}

impl Evaluator for CompiledFunction {
    fn dim(&self) -> usize {
        self.dim
    }

    fn input_len(&self) -> usize {
        self.input_len
    }

    fn eval(&mut self, inputs: &[f64]) -> Result<f64, EvalError> {
        CompiledFunction::eval(self, inputs)
    }

    fn eval_with_scratch(&self, inputs: &[f64], scratch: &mut [f64]) -> Result<f64, EvalError> {
        CompiledFunction::eval_with_scratch(self, inputs, scratch)
    }
}

impl std::fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("language", &self.language)
            .field("library_path", &self.library_path)
            .field("dim", &self.dim)
            .field("input_len", &self.input_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolchainError;
    use crate::graph::Graph;
    use crate::inputs::{Inputs, Scalar};
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;

    /// Records what it was asked to build, then fails.
    #[derive(Default)]
    struct RecordingToolchain {
        seen: RefCell<Option<(String, Language)>>,
    }

    impl Toolchain for RecordingToolchain {
        fn build(&self, source: &Path, language: Language) -> Result<PathBuf, ToolchainError> {
            let text = fs::read_to_string(source)?;
            *self.seen.borrow_mut() = Some((text, language));
            Err(ToolchainError::Failed {
                tool: "mock".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "refused".to_string(),
            })
        }
    }

    /// Produces a file that is not a shared library.
    struct GarbageToolchain;

    impl Toolchain for GarbageToolchain {
        fn build(&self, source: &Path, _: Language) -> Result<PathBuf, ToolchainError> {
            let library = source.with_extension("so");
            fs::write(&library, b"not an ELF object")?;
            Ok(library)
        }
    }

    fn available(language: Language) -> Option<CompileOptions> {
        let options = CompileOptions::new(language);
        if !options.toolchain.supports(language) {
            eprintln!("{language} toolchain not found, skipping test");
            return None;
        }
        Some(options)
    }

    #[test]
    fn test_toolchain_receives_generated_source() {
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let f = (x.at(0) + x.at(1)) * x.at(0) - 3.0;

        for language in [Language::C, Language::Nasm] {
            let toolchain = RecordingToolchain::default();
            let options = CompileOptions::new(language);
            let err = compile_with(&graph.store(), f.index(), &options, &toolchain).unwrap_err();
            assert!(matches!(err, CompileError::Toolchain(ToolchainError::Failed { .. })));

            let (text, seen) = toolchain.seen.take().unwrap();
            assert_eq!(seen, language);
            assert_eq!(text, graph.generate(f.index(), language).text);
        }
    }

    #[test]
    fn test_garbage_library_fails_to_load() {
        let graph = Graph::new();
        let f = graph.constant(1.0);
        let err = compile_with(&graph.store(), f.index(), &CompileOptions::default(), &GarbageToolchain)
            .unwrap_err();
        assert!(matches!(err, CompileError::Load(LoadError::Open { .. })));
    }

    #[test]
    fn test_kept_artifacts_survive_failure() {
        let work = tempfile::tempdir().unwrap();
        let graph = Graph::new();
        let f = graph.constant(2.5);
        let options = CompileOptions::default()
            .with_work_dir(work.path())
            .with_keep_artifacts(true);
        let _ = compile_with(&graph.store(), f.index(), &options, &RecordingToolchain::default());

        let dirs: Vec<_> = fs::read_dir(work.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(dirs.len(), 1);
        let name = dirs[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("fncas-"));
        assert!(dirs[0].join("expr.c").is_file());
    }

    #[test]
    fn test_temporary_directory_is_removed() {
        let work = tempfile::tempdir().unwrap();
        let graph = Graph::new();
        let f = graph.constant(2.5);
        let options = CompileOptions::default().with_work_dir(work.path());
        let _ = compile_with(&graph.store(), f.index(), &options, &RecordingToolchain::default());
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
    }

    fn check_scenario(language: Language) {
        let Some(options) = available(language) else {
            return;
        };
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let f = (x.at(0) + x.at(1)) * x.at(0) - 3.0;

        let mut compiled = f.compile(&options).unwrap();
        assert!(compiled.dim() >= f.index().as_usize() + 1);
        assert_eq!(compiled.reported_dim(), 7);
        assert_eq!(compiled.eval(&[2.0, 5.0]).unwrap(), 11.0);
        assert_eq!(compiled.eval(&[2.0, 5.0]).unwrap(), 11.0);
        assert_eq!(
            compiled.eval(&[2.0]),
            Err(EvalError::InvalidInputLength {
                expected: 2,
                got: 1
            })
        );

        let library = compiled.library_path().to_path_buf();
        let dir = compiled.artifacts_dir().to_path_buf();
        assert!(dir.join(format!("expr.{}", language.extension())).is_file());
        drop(compiled);
        assert!(!library.exists());
        assert!(!dir.exists());
    }

    #[test]
    fn test_c_scenario() {
        check_scenario(Language::C);
    }

    #[test]
    fn test_nasm_scenario() {
        check_scenario(Language::Nasm);
    }

    fn check_agreement(language: Language) {
        let Some(options) = available(language) else {
            return;
        };
        let graph = Graph::new();
        let x = graph.placeholder(3);
        let arithmetic = x.at(0) / x.at(1) - x.at(2) * 0.1 + 1.0 / 3.0;
        let functions = x.at(0).exp().sqrt() + x.at(1).sin() * x.at(2).cos() - x.at(0).ln()
            + (x.at(1) / 10.0).asin()
            + (x.at(2) / 10.0).acos() * x.at(0).tan()
            - x.at(1).atan();

        let mut native = arithmetic.compile(&options).unwrap();
        let mut jit = arithmetic.jit().unwrap();
        for inputs in [[1.0, 3.0, 7.0], [2.5, -0.5, 1e-3], [1.0, 0.0, 0.0], [0.0, 0.0, 0.0]] {
            let expected = arithmetic.eval(&inputs).unwrap();
            let got = native.eval(&inputs).unwrap();
            if expected.is_nan() {
                assert!(got.is_nan() && jit.eval(&inputs).unwrap().is_nan());
            } else {
                assert_eq!(got.to_bits(), expected.to_bits(), "{language} {inputs:?}");
                assert_eq!(jit.eval(&inputs).unwrap().to_bits(), expected.to_bits());
            }
        }

        let mut native = functions.compile(&options).unwrap();
        for inputs in [[0.5, 1.0, 2.0], [3.0, -4.0, 5.0], [-1.0, 0.0, 0.0]] {
            let expected = functions.eval(&inputs).unwrap();
            let got = native.eval(&inputs).unwrap();
            if expected.is_nan() {
                assert!(got.is_nan());
            } else {
                assert_abs_diff_eq!(got, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_c_agrees_with_interpreter() {
        check_agreement(Language::C);
    }

    #[test]
    fn test_nasm_agrees_with_interpreter() {
        check_agreement(Language::Nasm);
    }

    #[test]
    fn test_division_by_zero_natively() {
        let Some(options) = available(Language::C) else {
            return;
        };
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let mut compiled = (x.at(0) / x.at(1)).compile(&options).unwrap();
        assert_eq!(compiled.eval(&[1.0, 0.0]).unwrap(), f64::INFINITY);
        assert!(compiled.eval(&[0.0, 0.0]).unwrap().is_nan());
    }

    #[test]
    fn test_non_finite_constants() {
        let graph = Graph::new();
        let x = graph.placeholder(1);
        let f = x.at(0) * f64::INFINITY + f64::NEG_INFINITY;
        for language in [Language::C, Language::Nasm] {
            let Some(options) = available(language) else {
                continue;
            };
            let mut compiled = f.compile(&options).unwrap();
            assert_eq!(compiled.eval(&[-1.0]).unwrap(), f64::NEG_INFINITY);
            assert!(compiled.eval(&[1.0]).unwrap().is_nan());
        }
    }

    #[test]
    fn test_subgraph_and_shared_scratch() {
        let Some(options) = available(Language::C) else {
            return;
        };
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let inner = x.at(0) * x.at(1);
        let _outer = inner + 100.0;

        let compiled = inner.compile(&options).unwrap();
        assert_eq!(compiled.dim(), inner.index().as_usize() + 1);

        std::thread::scope(|scope| {
            for i in 0..4 {
                let compiled = &compiled;
                scope.spawn(move || {
                    let mut scratch = vec![0.0; compiled.dim()];
                    let v = f64::from(i);
                    assert_eq!(compiled.eval_with_scratch(&[v, 2.0], &mut scratch).unwrap(), v * 2.0);
                });
            }
        });
    }

    #[test]
    fn test_constant_graph_matches_direct_arithmetic() {
        let graph = Graph::new();
        let c = |value: f64| graph.constant(value);
        let f = (c(0.1) + c(0.2)) * c(3.0) / c(7.0) - c(1e-300) + c(2.0).sqrt();
        let direct = (0.1 + 0.2) * 3.0 / 7.0 - 1e-300 + 2.0_f64.sqrt();
        let negative_nan = f64::from_bits(0xfff8_0000_0000_0000);
        let g = c(negative_nan);

        for (root, expected) in [(f, direct), (g, negative_nan)] {
            assert_eq!(root.eval(&[]).unwrap().to_bits(), expected.to_bits());
            assert_eq!(root.jit().unwrap().eval(&[]).unwrap().to_bits(), expected.to_bits());
            for language in [Language::C, Language::Nasm] {
                let Some(options) = available(language) else {
                    continue;
                };
                let mut compiled = root.compile(&options).unwrap();
                let got = compiled.eval(&[]).unwrap();
                assert_eq!(got.to_bits(), expected.to_bits(), "{language}: {got:?}");
            }
        }
    }

    #[test]
    fn test_compiling_twice_gives_independent_libraries() {
        let graph = Graph::new();
        let x = graph.placeholder(2);
        let f = (x.at(0) - x.at(1)).exp() / (x.at(1) * x.at(1) + 1.0);

        for language in [Language::C, Language::Nasm] {
            let Some(options) = available(language) else {
                continue;
            };
            let mut first = f.compile(&options).unwrap();
            let mut second = f.compile(&options).unwrap();
            assert_ne!(first.artifacts_dir(), second.artifacts_dir());
            assert_ne!(first.library_path(), second.library_path());
            assert_eq!(first.dim(), second.dim());

            for inputs in [[0.0, 0.0], [1.5, -2.0], [-3.0, 0.25]] {
                let a = first.eval(&inputs).unwrap();
                let b = second.eval(&inputs).unwrap();
                assert_eq!(a.to_bits(), b.to_bits(), "{language} {inputs:?}");
            }

            drop(first);
            assert_eq!(second.eval(&[1.0, 1.0]).unwrap(), 0.5);
        }
    }
}
