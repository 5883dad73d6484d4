//! # Section
//!
//! This module covers fixed file regions: wiping the signature block and writing the extension
//! section into the space it frees up

use std::fmt;
use std::io;

use thiserror::Error;
use tracing::debug;

use crate::patcher::Patcher;

/// Largest buffer of zeros written in a single call while stripping a region
const ZERO_CHUNK: usize = 0x1000;

/// A contiguous byte range of the image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileRegion {
    /// Absolute file offset of the first byte
    pub offset: u64,
    /// Number of bytes reserved
    pub size: u64,
}
impl FileRegion {
    /// Creates a new region
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Whether `len` bytes fit inside the region
    pub fn fits(&self, len: usize) -> bool {
        len as u64 <= self.size
    }
}
impl fmt::Display for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.offset, self.offset.saturating_add(self.size))
    }
}

/// Errors when writing to a [`FileRegion`]
#[derive(Debug, Error)]
pub enum SectionError {
    /// The code is bigger than the space reserved for it
    #[error("{len} bytes of code do not fit in the {} byte region at {:#x}", .region.size, .region.offset)]
    CapacityExceeded {
        /// Region the code was meant for
        region: FileRegion,
        /// Size of the code
        len: usize,
    },
    /// Error while writing to the image
    #[error("failed to write region {region}")]
    Write {
        /// Region being written
        region: FileRegion,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Overwrites every byte of `region` with zero
pub fn strip_region<P: Patcher + ?Sized>(
    patcher: &mut P,
    region: FileRegion,
) -> Result<(), SectionError> {
    debug!("zeroing {:#x} bytes at {:#x}", region.size, region.offset);

    let zeros = [0u8; ZERO_CHUNK];
    let mut done = 0u64;
    while done < region.size {
        let len = (region.size - done).min(ZERO_CHUNK as u64) as usize;
        patcher
            .write_at(region.offset + done, &zeros[..len])
            .map_err(|source| SectionError::Write { region, source })?;
        done += len as u64;
    }
    Ok(())
}

/// Writes `code` at the start of `region`.
///
/// Fails with [`SectionError::CapacityExceeded`] before touching the image if `code` is larger than
/// the region. Bytes of the region past the end of `code` are left as they are.
pub fn inject<P: Patcher + ?Sized>(
    patcher: &mut P,
    region: FileRegion,
    code: &[u8],
) -> Result<(), SectionError> {
    if !region.fits(code.len()) {
        return Err(SectionError::CapacityExceeded {
            region,
            len: code.len(),
        });
    }

    debug!(
        "writing {:#x} of {:#x} bytes at {:#x}",
        code.len(),
        region.size,
        region.offset
    );
    patcher
        .write_at(region.offset, code)
        .map_err(|source| SectionError::Write { region, source })
}
