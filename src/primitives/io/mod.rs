#![forbid(unsafe_code)]

use std::{
    fs::File,
    io::{self, ErrorKind},
    sync::Arc,
};

use tracing::trace;

use crate::types::{PagingError, Result};

/// Positioned I/O over a page backing file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` with the bytes stored at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn set_len(&self, len: u64) -> Result<()>;
    /// Flushes file data to the device.
    fn sync_data(&self) -> Result<()>;
}

/// [`FileIo`] over a standard file handle.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already opened read-write file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !dst.is_empty() {
        let read = file.read_at(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "slot read reached EOF",
            ));
        }
        dst = &mut dst[read..];
        off += read as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    while !src.is_empty() {
        let written = file.write_at(src, off)?;
        if written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "slot write stalled"));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        let read = file.seek_read(dst, off)?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "slot read reached EOF",
            ));
        }
        dst = &mut dst[read..];
        off += read as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        let written = file.seek_write(src, off)?;
        if written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "slot write stalled"));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned reads unsupported on this platform",
    ))
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "positioned writes unsupported on this platform",
    ))
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        read_exact_at(self.file(), off, dst).map_err(PagingError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        write_all_at(self.file(), off, src).map_err(PagingError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(PagingError::from)
    }

    fn sync_data(&self) -> Result<()> {
        self.file().sync_data().map_err(PagingError::from)
    }
}
