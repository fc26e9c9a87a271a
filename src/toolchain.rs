//! Turning generated source into a shared library.
//!
//! [`Toolchain`] is the seam between code generation and loading: the loader writes the
//! generated text to disk, asks a toolchain for a library, and opens whatever path comes
//! back. [`CommandToolchain`] drives the system C compiler and NASM; tests substitute
//! their own implementations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;

use crate::codegen::Language;
use crate::config::ToolchainConfig;
use crate::errors::ToolchainError;

/// Builds a shared library exporting `eval` and `dim` from a generated source file.
pub trait Toolchain {
    /// Builds `source`, written in `language`, and returns the path of the library.
    fn build(&self, source: &Path, language: Language) -> Result<PathBuf, ToolchainError>;
}

/// Toolchain running external processes.
///
/// - C: `cc -O2 -ffp-contract=off -fPIC -shared -o expr.so expr.c -lm`
/// - NASM: `nasm -f elf64 -o expr.o expr.asm`, then `cc -shared -o expr.so expr.o -lm`
///
/// Floating-point contraction is disabled so the compiler cannot fuse a multiply and an
/// add into an FMA, which would round differently from the interpreter.
#[derive(Debug, Clone, Default)]
pub struct CommandToolchain {
    config: ToolchainConfig,
}

impl CommandToolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }
}

impl Toolchain for CommandToolchain {
    fn build(&self, source: &Path, language: Language) -> Result<PathBuf, ToolchainError> {
        let library = source.with_extension("so");
        let cc = self.config.resolve_cc()?;

        match language {
            Language::C => {
                let mut args: Vec<OsString> = ["-O2", "-ffp-contract=off", "-fPIC", "-shared"]
                    .into_iter()
                    .map(OsString::from)
                    .collect();
                args.extend(self.config.extra_cflags.iter().map(OsString::from));
                args.push("-o".into());
                args.push(library.clone().into());
                args.push(source.into());
                args.push("-lm".into());
                run_command(&cc, &args, &self.config.cc)?;
            }
            Language::Nasm => {
                let nasm = self.config.resolve_nasm()?;
                let object = source.with_extension("o");
                let args: Vec<OsString> = vec![
                    "-f".into(),
                    "elf64".into(),
                    "-o".into(),
                    object.clone().into(),
                    source.into(),
                ];
                run_command(&nasm, &args, &self.config.nasm)?;

                let args: Vec<OsString> = vec![
                    "-shared".into(),
                    "-o".into(),
                    library.clone().into(),
                    object.into(),
                    "-lm".into(),
                ];
                run_command(&cc, &args, &self.config.cc)?;
            }
        }

        if !library.is_file() {
            return Err(ToolchainError::MissingOutput(library));
        }
        Ok(library)
    }
}

fn run_command(program: &Path, args: &[OsString], label: &str) -> Result<(), ToolchainError> {
    debug!("running {} {:?}", program.display(), args);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => ToolchainError::ToolMissing(label.to_string()),
            _ => ToolchainError::Io(err),
        })?;

    if !output.status.success() {
        return Err(ToolchainError::Failed {
            tool: label.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
