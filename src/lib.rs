//! Paged storage for images larger than memory.
//!
//! Images are split into power-of-two pages kept in a per-image temporary
//! file. A process-wide [`CacheManager`] decides which pages stay resident,
//! evicting the least recently touched ones when the heap meter crosses its
//! watermarks.
//!
//! ```no_run
//! use largeimage::{CacheManager, Dims, ImageOptions, IntImage, PagingConfig};
//!
//! # fn main() -> largeimage::Result<()> {
//! // The monitor evicts pages when the heap meter crosses its high
//! // watermark; dropping it stops eviction.
//! let (manager, monitor) = CacheManager::start(PagingConfig::discover()?)?;
//! let image = IntImage::create(&manager, Dims::xy(8192, 8192), ImageOptions::default())?;
//! image.set_xy(10, 20, 7)?;
//! assert_eq!(image.get_xy(10, 20)?, 7);
//! monitor.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::PagingConfig;
pub use primitives::pager::{
    Backpressure, CacheManager, CacheStats, EvictionReport, HeapMeter, HeapMonitor, Pressure,
};
pub use storage::{
    Addressable, BoolImage, ByteImage, Coord, Dims, DoubleImage, Element, ImageOptions,
    ImageStats, IntImage, LargeImage,
};
pub use types::{ImageId, PageId, PagingError, Result};
