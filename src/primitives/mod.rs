//! Low-level primitives for the paging layer.
//!
//! Includes byte codecs, positioned file I/O, the reentrant manager lock,
//! and the global page cache with its eviction machinery.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width little-endian codecs used by the page format.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// The reentrant lock serializing every cache-manager critical section.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes against page backing files.
pub mod io;

/// Global page cache and eviction.
///
/// Tracks open images, orders resident pages by recency and evicts them
/// under heap pressure.
pub mod pager;
