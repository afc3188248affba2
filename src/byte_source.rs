//! Positioned reader over the archive file.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use proxmox_io::ReadExt;

use crate::error::{Result, VmaError};
use crate::progress::Counters;

/// Sequential reader over the archive, tracking the current offset.
///
/// The extractor thread is the sole reader; worker threads never touch the
/// source. A short read means a truncated archive and is reported as a
/// format error, everything else surfaces as an I/O error carrying the
/// failing offset.
pub struct ByteSource {
    file: File,
    position: u64,
    len: u64,
    counters: Arc<Counters>,
}

impl ByteSource {
    pub fn open(path: &Path, counters: Arc<Counters>) -> Result<Self> {
        let file = File::open(path).map_err(|source| VmaError::Io { offset: 0, source })?;
        let len = file
            .metadata()
            .map_err(|source| VmaError::Io { offset: 0, source })?
            .len();
        Ok(Self {
            file,
            position: 0,
            len,
            counters,
        })
    }

    /// Archive length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once the cursor reached the end of the archive. Extents are
    /// parsed until this trips between two of them.
    pub fn eof(&self) -> bool {
        self.position >= self.len
    }

    /// Read exactly `count` bytes at the current position.
    pub fn read_exact_allocated(&mut self, count: usize) -> Result<Vec<u8>> {
        let offset = self.position;
        let data = self
            .file
            .read_exact_allocated(count)
            .map_err(|err| map_read_err(offset, err))?;
        self.position += count as u64;
        self.counters.add_read(count as u64);
        Ok(data)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let offset = self.position;
        self.file
            .read_exact(buf)
            .map_err(|err| map_read_err(offset, err))?;
        self.position += buf.len() as u64;
        self.counters.add_read(buf.len() as u64);
        Ok(())
    }
}

fn map_read_err(offset: u64, err: std::io::Error) -> VmaError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        VmaError::format(offset, "unexpected end of archive")
    } else {
        VmaError::Io {
            offset,
            source: err,
        }
    }
}
