//! Identifiers, error type and checksums shared by every layer of the crate.

use std::fmt;

pub mod checksum;

pub use checksum::page_crc32;

/// Registry identifier assigned to an image by the cache manager.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ImageId(pub u64);

/// Index of a page inside one image.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Key of a page across all images tracked by one manager.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PageKey {
    /// Owning image.
    pub image: ImageId,
    /// Page inside the image.
    pub page: PageId,
}

impl PageKey {
    /// Builds a key from its parts.
    pub const fn new(image: ImageId, page: PageId) -> Self {
        Self { image, page }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.page)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

impl From<PageId> for u64 {
    fn from(value: PageId) -> Self {
        value.0
    }
}

/// Errors surfaced by the paging layer.
#[derive(thiserror::Error, Debug)]
pub enum PagingError {
    /// Backing file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A backing-file slot did not decode.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller passed an argument the operation cannot honor.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A page id at or beyond the image's page count was requested.
    #[error("page {page} out of range (image has {count} pages)")]
    PageOutOfRange {
        /// Requested page.
        page: PageId,
        /// Number of pages in the image.
        count: u64,
    },
    /// A discard was requested for a page that is not resident.
    #[error("page {0} is not resident")]
    NotResident(PageId),
    /// A coordinate exceeded the image dimensions.
    #[error("coordinate out of bounds: {axis}={value} (extent {extent})")]
    OutOfBounds {
        /// Axis name (`x`, `y`, `z`, `t` or `b`).
        axis: &'static str,
        /// Requested coordinate.
        value: u64,
        /// Extent of the axis.
        extent: u64,
    },
    /// The image hit a fatal backing-file error earlier and refuses further work.
    #[error("image {0} failed after a fatal backing-file error")]
    ImageFailed(ImageId),
    /// The image was closed.
    #[error("image {0} is closed")]
    Closed(ImageId),
    /// Configuration could not be loaded or is inconsistent.
    #[error("config: {0}")]
    Config(String),
}

impl PagingError {
    /// Returns true for errors that leave the image's backing file in an unknown state.
    pub fn is_fatal_io(&self) -> bool {
        matches!(self, PagingError::Io(_) | PagingError::Corruption(_))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PagingError>;
