//! Paged image storage.
//!
//! Pixels are grouped into fixed-size pages that live in memory while in use
//! and in a per-image temporary file otherwise. The shared
//! [`CacheManager`](crate::primitives::pager::CacheManager) decides which
//! pages stay resident.

/// Temporary slot file behind each image.
pub mod backing;
/// Pixel element types and their page kind tags.
pub mod element;
/// Paged images and their pixel accessors.
pub mod image;
/// Coordinate addressing and page geometry.
pub mod layout;
/// Pages and their encoded form.
pub mod page;

pub use backing::BackingFile;
pub use element::{Element, PageKind};
pub use image::{
    BoolImage, ByteImage, DoubleImage, ImageOptions, ImageStats, IntImage, LargeImage,
};
pub use layout::{
    page_pixels_for_budget, page_pixels_for_heap, Addressable, Coord, Dims, PageLayout,
};
pub use page::{BoolPage, BytePage, DoublePage, IntPage, Page, PageHeader};
