//! Native build configuration.
//!
//! Tool names default to `cc` and `nasm` and can be overridden through the `FNCAS_CC` and
//! `FNCAS_NASM` environment variables. Names are resolved against `PATH` with `which`
//! when a build runs, so a missing tool is reported as
//! [`ToolchainError::ToolMissing`] rather than as a failed spawn.

use std::path::{Path, PathBuf};

use crate::codegen::Language;
use crate::errors::ToolchainError;

/// Environment variable overriding the C compiler.
pub const CC_ENV: &str = "FNCAS_CC";
/// Environment variable overriding the assembler.
pub const NASM_ENV: &str = "FNCAS_NASM";

/// External tools used to turn generated code into a shared library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainConfig {
    /// C compiler, also used as the linker for assembled objects
    pub cc: String,
    /// Netwide Assembler
    pub nasm: String,
    /// Additional flags passed to the C compiler when building C sources
    pub extra_cflags: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cc: "cc".to_string(),
            nasm: "nasm".to_string(),
            extra_cflags: Vec::new(),
        }
    }
}

impl ToolchainConfig {
    /// Defaults with the environment overrides applied. Empty values are ignored.
    pub fn from_env() -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        }

        let defaults = Self::default();
        Self {
            cc: var(CC_ENV).unwrap_or(defaults.cc),
            nasm: var(NASM_ENV).unwrap_or(defaults.nasm),
            extra_cflags: defaults.extra_cflags,
        }
    }

    /// Looks the C compiler up on `PATH` (or takes it as given if it is a path).
    ///
    /// # Errors
    /// Returns [`ToolchainError::ToolMissing`] if it cannot be found.
    pub fn resolve_cc(&self) -> Result<PathBuf, ToolchainError> {
        resolve(&self.cc)
    }

    pub fn resolve_nasm(&self) -> Result<PathBuf, ToolchainError> {
        resolve(&self.nasm)
    }

    /// Whether every tool needed for `language` can be found.
    pub fn supports(&self, language: Language) -> bool {
        match language {
            Language::C => self.resolve_cc().is_ok(),
            Language::Nasm => self.resolve_cc().is_ok() && self.resolve_nasm().is_ok(),
        }
    }
}

fn resolve(program: &str) -> Result<PathBuf, ToolchainError> {
    which::which(program).map_err(|_| ToolchainError::ToolMissing(program.to_string()))
}

/// Options for [`compile`](crate::loader::compile).
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Which generator feeds the toolchain
    pub language: Language,
    /// Keep the build directory after the function is dropped
    pub keep_artifacts: bool,
    /// Parent of the per-build directory; the system temp directory if `None`
    pub work_dir: Option<PathBuf>,
    pub toolchain: ToolchainConfig,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            language: Language::default(),
            keep_artifacts: false,
            work_dir: None,
            toolchain: ToolchainConfig::from_env(),
        }
    }
}

impl CompileOptions {
    /// Defaults for `language`, with the toolchain taken from the environment.
    pub fn new(language: Language) -> Self {
        Self::default().with_language(language)
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Keeps the `fncas-*` build directory after the compiled function is dropped, so the
    /// generated source and the library can be inspected.
    pub fn with_keep_artifacts(mut self, keep: bool) -> Self {
        self.keep_artifacts = keep;
        self
    }

    /// Creates build directories under `dir` instead of the system temp directory.
    ///
    /// # Arguments
    /// * `dir` - Existing directory; it is not created on demand
    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainConfig) -> Self {
        self.toolchain = toolchain;
        self
    }
}
