//! Streamed-file backend — positioned reads/writes via `std::fs::File`.
//!
//! `read` seeks to `offset`, allocates `size` bytes, and returns them as
//! [`ReadBuf::Owned`]; `manual_buffer` is true for this backend (the buffer
//! is caller-owned).

use super::{Backend, ReadBuf};
use crate::error::{Result, WhisperError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Default)]
pub struct FileBackend {
    file: Option<File>,
}

impl FileBackend {
    pub fn new() -> Self {
        Self { file: None }
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file.as_mut().ok_or(WhisperError::NotOpen)
    }
}

impl Backend for FileBackend {
    fn open(&mut self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn read(&mut self, offset: u64, size: usize) -> Result<ReadBuf<'_>> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).map_err(|_| WhisperError::Offset)?;

        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        Ok(ReadBuf::Owned(buf))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(offset)).map_err(|_| WhisperError::Offset)?;
        file.write_all(buf)?;
        Ok(())
    }
}
