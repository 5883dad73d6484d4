//! # Asm
//!
//! This module covers the external toolchains that turn sources into raw machine code.
//!
//! Every tool is judged on its exit status alone. Whatever it prints is shown to the user as
//! diagnostics and never decides success or failure.

pub mod external;
pub mod nasm;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use thiserror::Error;
use tracing::info;

pub use external::ExternalBuild;
pub use nasm::Nasm;

/// Turns an assembly source into a raw machine code buffer
pub trait Assembler {
    /// Assembles `source`, returning the machine code it produced.
    ///
    /// Implementations run a fresh build on every call, callers revalidate any size limits
    /// against the returned buffer.
    fn assemble(&self, source: &Path) -> Result<Vec<u8>, ToolchainError>;
}

/// Errors from an external toolchain
#[derive(Debug, Error)]
pub enum ToolchainError {
    /// The source doesn't look like something the assembler accepts
    #[error("{} is not an assembly source (expected a `.s` file)", .path.display())]
    NotAssembly {
        /// The rejected source
        path: PathBuf,
    },
    /// The tool couldn't be started
    #[error("failed to run `{command}`")]
    Launch {
        /// Command line that was attempted
        command: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The tool ran but reported failure
    #[error("`{command}` failed with {status}")]
    Failed {
        /// Command line that failed
        command: String,
        /// Exit status of the tool
        status: ExitStatus,
    },
    /// The output of an earlier run couldn't be removed before running the tool
    #[error("failed to remove stale output {}", .path.display())]
    StaleOutput {
        /// Leftover output file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The tool succeeded but its output can't be read
    #[error("`{command}` produced no readable output at {}", .path.display())]
    MissingOutput {
        /// Command line that ran
        command: String,
        /// Where the output was expected
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The tool succeeded but produced an empty buffer
    #[error("`{command}` produced an empty output file {}", .path.display())]
    EmptyOutput {
        /// Command line that ran
        command: String,
        /// The empty output file
        path: PathBuf,
    },
}

/// Printable form of a command line
struct CommandLine<'a>(&'a Command);
impl fmt::Display for CommandLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.get_program().to_string_lossy())?;
        for arg in self.0.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs `command` to completion, showing anything it prints.
///
/// Returns the printable command line so callers can name it in later errors.
fn run(command: &mut Command) -> Result<String, ToolchainError> {
    let line = CommandLine(command).to_string();
    let output = command.output().map_err(|source| ToolchainError::Launch {
        command: line.clone(),
        source,
    })?;

    if !output.stdout.is_empty() || !output.stderr.is_empty() {
        info!("Executing \"{}\":", line);
        for text in [&output.stdout, &output.stderr] {
            for diagnostic in String::from_utf8_lossy(text).lines() {
                info!("  {}", diagnostic);
            }
        }
    }

    if output.status.success() {
        Ok(line)
    } else {
        Err(ToolchainError::Failed {
            command: line,
            status: output.status,
        })
    }
}

/// Removes whatever an earlier run left at `path`, so only fresh output is ever read back
fn clear_output(path: &Path) -> Result<(), ToolchainError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(ToolchainError::StaleOutput {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

/// Reads the non-empty output file a tool left at `path`
fn read_output(command: String, path: &Path) -> Result<Vec<u8>, ToolchainError> {
    match fs::read(path) {
        Ok(code) if code.is_empty() => Err(ToolchainError::EmptyOutput {
            command,
            path: path.to_path_buf(),
        }),
        Ok(code) => Ok(code),
        Err(source) => Err(ToolchainError::MissingOutput {
            command,
            path: path.to_path_buf(),
            source,
        }),
    }
}
