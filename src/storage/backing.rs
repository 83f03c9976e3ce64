//! Temporary backing file holding one fixed-size slot per page.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tempfile::{Builder, TempPath};
use tracing::{debug, info};

use super::page::PageHeader;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{PageId, PagingError, Result};

/// Slot array of one image.
///
/// Slot `n` starts at byte `n * slot_len`. Every slot holds a placeholder page
/// from creation on, so a load never reads past a written offset.
pub struct BackingFile {
    io: Arc<dyn FileIo>,
    path: Option<TempPath>,
    slot_len: usize,
    slots: u64,
}

impl BackingFile {
    /// Creates a temporary file in `dir` (or the system temp dir) and fills it
    /// with placeholders. The file is removed when the backing file is closed
    /// or dropped.
    pub fn create_temp(dir: Option<&Path>, slot_len: usize, slots: u64) -> Result<Self> {
        let mut builder = Builder::new();
        builder.prefix("largeimage-").suffix(".pages");
        let named = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = named.into_parts();
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::new(file));
        let mut backing = Self::with_io(io, slot_len, slots)?;
        info!(
            path = %path.display(),
            slots,
            slot_len,
            "storage.backing.create"
        );
        backing.path = Some(path);
        Ok(backing)
    }

    /// Opens an existing file at `path` without owning its lifetime.
    pub fn open(path: &Path, slot_len: usize, slots: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::new(file));
        let expected = slot_len as u64 * slots;
        if io.len()? != expected {
            return Err(PagingError::Corruption("backing file length mismatch"));
        }
        Ok(Self {
            io,
            path: None,
            slot_len,
            slots,
        })
    }

    /// Sizes `io` for `slots` slots and writes a placeholder into each.
    pub fn with_io(io: Arc<dyn FileIo>, slot_len: usize, slots: u64) -> Result<Self> {
        let backing = Self {
            io,
            path: None,
            slot_len,
            slots,
        };
        backing.fill()?;
        Ok(backing)
    }

    fn fill(&self) -> Result<()> {
        let len = (self.slot_len as u64)
            .checked_mul(self.slots)
            .ok_or(PagingError::Invalid("backing file size overflows u64"))?;
        self.io.set_len(len)?;
        let mut slot = vec![0u8; self.slot_len];
        for page in 0..self.slots {
            PageHeader::placeholder(PageId(page)).encode(&mut slot)?;
            self.io.write_at(self.offset(PageId(page)), &slot)?;
        }
        debug!(slots = self.slots, bytes = len, "storage.backing.fill");
        Ok(())
    }

    fn offset(&self, page: PageId) -> u64 {
        page.0 * self.slot_len as u64
    }

    fn check(&self, page: PageId, len: usize) -> Result<()> {
        if page.0 >= self.slots {
            return Err(PagingError::PageOutOfRange {
                page,
                count: self.slots,
            });
        }
        if len != self.slot_len {
            return Err(PagingError::Invalid("slot buffer size mismatch"));
        }
        Ok(())
    }

    /// Reads slot `page` into `dst`.
    pub fn read_slot(&self, page: PageId, dst: &mut [u8]) -> Result<()> {
        self.check(page, dst.len())?;
        self.io.read_at(self.offset(page), dst)
    }

    /// Overwrites slot `page` with `src`.
    pub fn write_slot(&self, page: PageId, src: &[u8]) -> Result<()> {
        self.check(page, src.len())?;
        self.io.write_at(self.offset(page), src)
    }

    /// Bytes per slot.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Number of slots.
    pub fn slots(&self) -> u64 {
        self.slots
    }

    /// Current file length.
    pub fn file_len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Location of the file, when it is a temporary file owned by this value.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Flushes written slots to the device.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_data()
    }

    /// Releases the file and deletes it if it is temporary.
    pub fn close(self) -> Result<()> {
        let Self { io, path, .. } = self;
        drop(io);
        if let Some(path) = path {
            let shown = path.display().to_string();
            path.close()?;
            debug!(path = %shown, "storage.backing.delete");
        }
        Ok(())
    }
}
