//! This module contains the patch table, a fixed set of literal byte overwrites

use std::io;

use thiserror::Error;
use tracing::debug;

use super::Patcher;

/// Errors when building or applying a [`PatchTable`]
#[derive(Debug, Error)]
pub enum TableError {
    /// Two entries cover some of the same bytes
    #[error("patch at {second:#x} overlaps the {len} byte patch at {first:#x}")]
    Overlap {
        /// Offset of the earlier entry
        first: u64,
        /// Length of the earlier entry
        len: usize,
        /// Offset of the entry that starts inside the earlier one
        second: u64,
    },
    /// An entry runs past the end of the addressable file
    #[error("{len} byte patch at {offset:#x} overflows the file offset range")]
    OutOfRange {
        /// Offset of the entry
        offset: u64,
        /// Length of the entry
        len: usize,
    },
    /// Error while writing an entry to the image
    #[error("failed to write patch at {offset:#x}")]
    Write {
        /// Offset of the entry that failed
        offset: u64,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

/// Literal bytes to write at an absolute file offset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    /// Absolute file offset of the first byte
    pub offset: u64,
    /// Bytes written verbatim
    pub bytes: Vec<u8>,
}
impl PatchEntry {
    /// Creates a new patch entry
    pub fn new(offset: u64, bytes: Vec<u8>) -> Self {
        Self { offset, bytes }
    }

    /// One past the last offset this entry writes, or `None` if that isn't representable
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.bytes.len() as u64)
    }
}

/// A validated set of [`PatchEntry`] values whose ranges never intersect.
///
/// Entries are kept sorted by offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchTable {
    /// Entries sorted by offset
    entries: Vec<PatchEntry>,
}
impl PatchTable {
    /// Builds a table, rejecting entries that overlap each other or overflow the offset range.
    /// Entries that merely touch are fine.
    pub fn new(entries: impl IntoIterator<Item = PatchEntry>) -> Result<Self, TableError> {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort_by_key(|e| e.offset);

        for entry in &entries {
            if entry.end().is_none() {
                return Err(TableError::OutOfRange {
                    offset: entry.offset,
                    len: entry.bytes.len(),
                });
            }
        }
        for pair in entries.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            // `end` was checked above
            if first.end().unwrap_or(u64::MAX) > second.offset {
                return Err(TableError::Overlap {
                    first: first.offset,
                    len: first.bytes.len(),
                    second: second.offset,
                });
            }
        }

        Ok(Self { entries })
    }

    /// Entries in offset order
    pub fn entries(&self) -> &[PatchEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes every entry to the image.
    ///
    /// Stops at the first failed write. Entries written before the failure are left in place.
    pub fn apply<P: Patcher + ?Sized>(&self, patcher: &mut P) -> Result<(), TableError> {
        for entry in &self.entries {
            debug!(
                "patching {} byte(s) at {:#x}",
                entry.bytes.len(),
                entry.offset
            );
            patcher
                .write_at(entry.offset, &entry.bytes)
                .map_err(|source| TableError::Write {
                    offset: entry.offset,
                    source,
                })?;
        }
        Ok(())
    }
}
