//! Memory-mapped backend — the whole file as one `MAP_SHARED` mapping.
//!
//! `read` returns a borrowed slice directly into the mapping — no
//! allocation, no copy. `write` is a byte copy into the mapped region;
//! durability is left to the kernel (no explicit `msync`). Built directly on
//! `libc::mmap`/`libc::munmap` rather than a third-party mmap crate, the way
//! a systems-level library wraps this syscall pair when it needs precise
//! control over unmap-on-drop and error surfacing.

use super::{Backend, ReadBuf};
use crate::error::{Result, WhisperError};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

pub struct MmapBackend {
    // Kept open for the lifetime of the mapping; mmap does not need the fd
    // afterward but munmap needs nothing from it either — held so the
    // backend owns a single coherent resource to drop in the right order.
    file: Option<File>,
    map: Option<NonNull<libc::c_void>>,
    len: usize,
}

impl Default for MmapBackend {
    fn default() -> Self {
        Self { file: None, map: None, len: 0 }
    }
}

impl MmapBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn map_slice(&self) -> Result<&[u8]> {
        let map = self.map.ok_or(WhisperError::NotOpen)?;
        // SAFETY: `map` was produced by a successful `mmap` of `len` bytes
        // and is only unmapped in `close`/`Drop`, both of which also clear
        // `self.map`, so a live `NonNull` here always points at `len` valid
        // bytes for the lifetime of the returned borrow (tied to `&self`).
        Ok(unsafe { std::slice::from_raw_parts(map.as_ptr() as *const u8, self.len) })
    }
}

impl Backend for MmapBackend {
    fn open(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        if len == 0 {
            return Err(WhisperError::Io { source: io::Error::new(io::ErrorKind::InvalidData, "cannot mmap an empty file") });
        }

        // SAFETY: `file`'s descriptor is valid and open for read/write, and
        // `len` was just read from that same file's metadata.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        self.map = NonNull::new(ptr);
        self.len = len;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(map) = self.map.take() {
            // SAFETY: `map`/`self.len` describe the mapping established in
            // `open`; `close` is idempotent because `self.map` is cleared
            // first via `take`.
            let rc = unsafe { libc::munmap(map.as_ptr(), self.len) };
            if rc == -1 {
                return Err(io::Error::last_os_error().into());
            }
        }
        self.len = 0;
        self.file = None;
        Ok(())
    }

    fn read(&mut self, offset: u64, size: usize) -> Result<ReadBuf<'_>> {
        let slice = self.map_slice()?;
        let start = offset as usize;
        let end = start.checked_add(size).ok_or(WhisperError::Offset)?;
        if end > slice.len() {
            return Err(WhisperError::Offset);
        }
        Ok(ReadBuf::Borrowed(&slice[start..end]))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let map = self.map.ok_or(WhisperError::NotOpen)?;
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(WhisperError::Offset)?;
        if end > self.len {
            return Err(WhisperError::Offset);
        }
        // SAFETY: `start..end` was just bounds-checked against `self.len`,
        // and `map` points at a live `MAP_SHARED` region of that length.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), (map.as_ptr() as *mut u8).add(start), buf.len());
        }
        Ok(())
    }
}

impl Drop for MmapBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
