//! I/O backend interface — the single abstraction that lets the archive
//! engine treat memory-mapped and streamed files identically.
//!
//! The reference implementation represents this as a capability record of
//! function pointers plus a `manual_buf` flag telling the caller whether the
//! `read` buffer needs to be freed by hand. Here the ownership distinction
//! is a type, [`ReadBuf`], rather than a flag a caller can forget to check.

pub mod file;
#[cfg(unix)]
pub mod mmap;

use crate::error::Result;
use std::ops::Deref;
use std::path::Path;

/// A buffer returned by [`Backend::read`]. `Owned` is caller-owned and frees
/// itself when dropped (the streamed backend's case); `Borrowed` is backed
/// by the mapping and must not outlive it (the mmap backend's case). There
/// is no explicit "release" call for a caller to forget — `Owned` drops its
/// `Vec` normally and `Borrowed` has no drop glue at all.
pub enum ReadBuf<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl<'a> Deref for ReadBuf<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ReadBuf::Owned(v) => v,
            ReadBuf::Borrowed(s) => s,
        }
    }
}

/// The capability set every backend implements: open, close, read, write.
///
/// `offset` is a plain `u64` rather than the reference's `long`, since
/// whisper files never approach negative or pointer-sized offsets.
pub trait Backend {
    fn open(&mut self, path: &Path) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn read(&mut self, offset: u64, size: usize) -> Result<ReadBuf<'_>>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}
