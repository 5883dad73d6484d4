//! # Hook
//!
//! This module covers hooks: small assembly sources that are assembled and written over the
//! executable's code at the offset named in their header

pub mod header;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::asm::{Assembler, ToolchainError};
use crate::code::x86;
use crate::patcher::Patcher;

pub use header::{parse_header, HeaderError};

/// What a hook's header says about it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookDescriptor {
    /// Display name of the hook
    pub name: String,
    /// Absolute file offset the assembled hook is written to
    pub target_offset: u64,
    /// Assembly source of the hook
    pub source_path: PathBuf,
}
impl HookDescriptor {
    /// Reads and parses the header line of the hook source at `path`
    pub fn read(path: &Path) -> Result<Self, HookError> {
        let read_error = |source: io::Error| HookError::Read {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = BufReader::new(File::open(path).map_err(read_error)?);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).map_err(read_error)?;

        let line = std::str::from_utf8(&line).map_err(|_| HeaderError::NotUtf8 {
            path: path.to_path_buf(),
        })?;
        Ok(parse_header(line, path)?)
    }
}

/// Errors when applying a hook
#[derive(Debug, Error)]
pub enum HookError {
    /// Error while reading the hook source
    #[error("failed to read hook source {}", .path.display())]
    Read {
        /// Hook source
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
    /// The hook's header is malformed
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// The hook couldn't be assembled
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
    /// The assembled hook would run past the end of the image
    #[error("hook '{name}' ({len} bytes at {offset:#x}) runs past the end of the {image_len:#x} byte image")]
    OutsideImage {
        /// Name of the hook
        name: String,
        /// Offset the hook was meant for
        offset: u64,
        /// Size of the assembled hook
        len: usize,
        /// Size of the image
        image_len: u64,
    },
    /// Error while writing the assembled hook to the image
    #[error("failed to write hook '{name}' at {offset:#x}")]
    Write {
        /// Name of the hook
        name: String,
        /// Offset the hook was being written to
        offset: u64,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Assembles the hook at `path` and writes it to the offset named in its header.
///
/// The hook must lie entirely within the first `image_len` bytes, so a wrong base image is
/// refused instead of grown. The image cursor is left where it was.
pub fn apply_hook<P, A>(
    patcher: &mut P,
    assembler: &A,
    path: &Path,
    image_len: u64,
) -> Result<HookDescriptor, HookError>
where
    P: Patcher + ?Sized,
    A: Assembler + ?Sized,
{
    let hook = HookDescriptor::read(path)?;
    info!("Applying hook '{}'", hook.name);

    let code = assembler.assemble(&hook.source_path)?;

    info!(
        "Applying {} byte(s) at {:#010x}",
        code.len(),
        hook.target_offset
    );
    let inside = hook
        .target_offset
        .checked_add(code.len() as u64)
        .map_or(false, |end| end <= image_len);
    if !inside {
        return Err(HookError::OutsideImage {
            name: hook.name,
            offset: hook.target_offset,
            len: code.len(),
            image_len,
        });
    }
    for line in x86::file_listing(&code, hook.target_offset) {
        debug!("  {}", line);
    }

    patcher
        .write_at(hook.target_offset, &code)
        .map_err(|source| HookError::Write {
            name: hook.name.clone(),
            offset: hook.target_offset,
            source,
        })?;
    Ok(hook)
}
