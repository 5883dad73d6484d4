//! This module contains the NASM assembler gateway

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use super::{clear_output, read_output, run, Assembler, ToolchainError};

/// Extension every assembly source must have
const SOURCE_EXTENSION: &str = "s";
/// Suffix given to assembled output files in the build directory
const OUTPUT_SUFFIX: &str = ".asm.bin";

/// Assembles flat binaries with `nasm <source> -o <build_dir>/<stem>.asm.bin`
#[derive(Clone, Debug)]
pub struct Nasm {
    /// The nasm executable
    program: PathBuf,
    /// Directory the assembled binaries are written to
    build_dir: PathBuf,
}
impl Nasm {
    /// Creates a gateway running `program` and writing into `build_dir`
    pub fn new(program: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            build_dir: build_dir.into(),
        }
    }

    /// Where the assembled form of `source` is written
    pub fn output_path(&self, source: &Path) -> Result<PathBuf, ToolchainError> {
        let not_assembly = || ToolchainError::NotAssembly {
            path: source.to_path_buf(),
        };

        if source.extension().and_then(|e| e.to_str()) != Some(SOURCE_EXTENSION) {
            return Err(not_assembly());
        }
        let mut name: OsString = source.file_stem().ok_or_else(not_assembly)?.to_owned();
        name.push(OUTPUT_SUFFIX);
        Ok(self.build_dir.join(name))
    }
}
impl Assembler for Nasm {
    fn assemble(&self, source: &Path) -> Result<Vec<u8>, ToolchainError> {
        let output = self.output_path(source)?;
        info!("Compiling {}", source.display());
        clear_output(&output)?;

        let command = run(Command::new(&self.program)
            .arg(source)
            .arg("-o")
            .arg(&output))?;
        read_output(command, &output)
    }
}
