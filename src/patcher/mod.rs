//! # Patcher
//!
//! This module covers patchers, which write byte buffers at absolute offsets of an open image
//! without disturbing the image's sequential cursor

pub mod table;

use std::io::{self, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};

/// Anything that can write a buffer at an absolute offset of an image.
///
/// Implemented for every [`Write`] + [`Seek`] type, so both [`std::fs::File`] and in-memory
/// cursors can be patched.
pub trait Patcher {
    /// Writes all of `data` starting exactly at `offset`.
    ///
    /// The logical cursor of the underlying stream is the same after this call as it was before,
    /// whether the write succeeded or not. Either the whole buffer is written or an error is returned.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}

impl<W: Write + Seek> Patcher for W {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut guard = CursorGuard::save(self)?;
        guard.seek(SeekFrom::Start(offset))?;
        guard.write_all(data)?;
        guard.restore()
    }
}

/// Guard for a stream's cursor. When this guard is dropped, the cursor is moved back to where it
/// was when the guard was created.
///
/// Use [`CursorGuard::restore`] on the success path to observe seek errors, since [`Drop::drop`]
/// can only restore on a best-effort basis.
pub struct CursorGuard<'a, S: Seek> {
    /// Stream whose cursor we're guarding
    inner: &'a mut S,
    /// Position of the cursor when the guard was created
    position: u64,
    /// Set once the position has been restored so `drop` doesn't seek a second time
    restored: bool,
}
impl<'a, S: Seek> CursorGuard<'a, S> {
    /// Records the current cursor position of `inner`
    pub fn save(inner: &'a mut S) -> io::Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self {
            inner,
            position,
            restored: false,
        })
    }

    /// Position the cursor will be restored to
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Moves the cursor back to the saved position, reporting any seek failure
    pub fn restore(mut self) -> io::Result<()> {
        self.restored = true;
        self.inner.seek(SeekFrom::Start(self.position)).map(|_| ())
    }
}
impl<S: Seek> Deref for CursorGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.inner
    }
}
impl<S: Seek> DerefMut for CursorGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        self.inner
    }
}
impl<S: Seek> Drop for CursorGuard<'_, S> {
    fn drop(&mut self) {
        if !self.restored {
            // nowhere to report a failure from here, the caller is already unwinding an error
            let _ = self.inner.seek(SeekFrom::Start(self.position));
        }
    }
}
