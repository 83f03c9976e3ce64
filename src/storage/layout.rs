//! Pixel addressing and page geometry.
//!
//! Pixels of a 5-D image are flattened band-fastest:
//! `b + bdim*(x + xdim*(y + ydim*(z + zdim*t)))`. Pages cover a power-of-two
//! run of that linear order, so page id and in-page offset are a shift and a
//! mask away from the linear index.

use serde::{Deserialize, Serialize};

use crate::types::{PageId, PagingError, Result};

/// Extents of an image along its five axes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Dims {
    /// Width.
    pub x: u64,
    /// Height.
    pub y: u64,
    /// Depth.
    pub z: u64,
    /// Time points.
    pub t: u64,
    /// Bands (channels).
    pub b: u64,
}

/// A pixel position; axes an accessor does not name are zero.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Coord {
    /// Column.
    pub x: u64,
    /// Row.
    pub y: u64,
    /// Slice.
    pub z: u64,
    /// Time point.
    pub t: u64,
    /// Band.
    pub b: u64,
}

impl Coord {
    /// Position in a 2-D image.
    pub const fn xy(x: u64, y: u64) -> Self {
        Self::xyztb(x, y, 0, 0, 0)
    }

    /// Position in a banded 2-D image.
    pub const fn xyb(x: u64, y: u64, b: u64) -> Self {
        Self::xyztb(x, y, 0, 0, b)
    }

    /// Position in a volume.
    pub const fn xyz(x: u64, y: u64, z: u64) -> Self {
        Self::xyztb(x, y, z, 0, 0)
    }

    /// Position in a banded volume.
    pub const fn xyzb(x: u64, y: u64, z: u64, b: u64) -> Self {
        Self::xyztb(x, y, z, 0, b)
    }

    /// Position in a time series of volumes.
    pub const fn xyzt(x: u64, y: u64, z: u64, t: u64) -> Self {
        Self::xyztb(x, y, z, t, 0)
    }

    /// Fully specified position.
    pub const fn xyztb(x: u64, y: u64, z: u64, t: u64, b: u64) -> Self {
        Self { x, y, z, t, b }
    }
}

impl Dims {
    /// Five-dimensional extents.
    pub const fn new(x: u64, y: u64, z: u64, t: u64, b: u64) -> Self {
        Self { x, y, z, t, b }
    }

    /// Single-band 2-D extents.
    pub const fn xy(x: u64, y: u64) -> Self {
        Self::new(x, y, 1, 1, 1)
    }

    /// Number of pixels, or `None` if it does not fit in `u64`.
    pub fn total_pixels(&self) -> Option<u64> {
        self.x
            .checked_mul(self.y)?
            .checked_mul(self.z)?
            .checked_mul(self.t)?
            .checked_mul(self.b)
    }

    /// Rejects a coordinate outside the extents.
    pub fn check(&self, c: Coord) -> Result<()> {
        for (axis, value, extent) in [
            ("x", c.x, self.x),
            ("y", c.y, self.y),
            ("z", c.z, self.z),
            ("t", c.t, self.t),
            ("b", c.b, self.b),
        ] {
            if value >= extent {
                return Err(PagingError::OutOfBounds {
                    axis,
                    value,
                    extent,
                });
            }
        }
        Ok(())
    }

    /// Linear index of an in-bounds coordinate.
    pub fn linear_index(&self, c: Coord) -> u64 {
        c.b + self.b * (c.x + self.x * (c.y + self.y * (c.z + self.z * c.t)))
    }

    /// Coordinate of a linear index; inverse of [`Dims::linear_index`].
    ///
    /// `None` when the index lies outside the image, which includes every
    /// index of an image with a zero-length axis.
    pub fn coords_of(&self, index: u64) -> Option<Coord> {
        if index >= self.total_pixels()? {
            return None;
        }
        let b = index % self.b;
        let rest = index / self.b;
        let x = rest % self.x;
        let rest = rest / self.x;
        let y = rest % self.y;
        let rest = rest / self.y;
        let z = rest % self.z;
        let t = rest / self.z;
        Some(Coord { x, y, z, t, b })
    }
}

/// How the pixels of one image are split into pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageLayout {
    dims: Dims,
    total: u64,
    page_size: u64,
    shift: u32,
    page_count: u64,
}

impl PageLayout {
    /// Builds the layout of `dims` with `page_size` pixels per page.
    pub fn new(dims: Dims, page_size: u64) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(PagingError::Invalid("page size must be a power of two"));
        }
        if usize::try_from(page_size).is_err() {
            return Err(PagingError::Invalid("page size exceeds address space"));
        }
        let total = dims
            .total_pixels()
            .ok_or(PagingError::Invalid("pixel count overflows u64"))?;
        if total == 0 {
            return Err(PagingError::Invalid("image dimensions must be non-zero"));
        }
        Ok(Self {
            dims,
            total,
            page_size,
            shift: page_size.trailing_zeros(),
            page_count: total.div_ceil(page_size),
        })
    }

    /// Image extents.
    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// Total pixels.
    pub fn total_pixels(&self) -> u64 {
        self.total
    }

    /// Pixels per page.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// `log2(page_size)`.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// `ceil(total_pixels / page_size)`.
    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Page and in-page offset holding a linear index.
    pub fn locate(&self, index: u64) -> Result<(PageId, usize)> {
        if index >= self.total {
            return Err(PagingError::OutOfBounds {
                axis: "index",
                value: index,
                extent: self.total,
            });
        }
        let offset = (index & (self.page_size - 1)) as usize;
        Ok((PageId(index >> self.shift), offset))
    }

    /// Errors with `PageOutOfRange` unless `page < page_count`.
    pub fn check_page(&self, page: PageId) -> Result<()> {
        if page.0 >= self.page_count {
            return Err(PagingError::PageOutOfRange {
                page,
                count: self.page_count,
            });
        }
        Ok(())
    }

    /// Linear index of the first pixel of `page`.
    pub fn page_start(&self, page: PageId) -> u64 {
        page.0 << self.shift
    }

    /// Logical length of `page` when it is the final, partial page.
    pub fn valid_length(&self, page: PageId) -> Option<usize> {
        let start = self.page_start(page);
        let remaining = self.total.saturating_sub(start);
        (remaining < self.page_size).then_some(remaining as usize)
    }

    /// Band held at slot 0 of `page` for multi-band images.
    pub fn band_offset(&self, page: PageId) -> Option<u64> {
        (self.dims.b > 1).then(|| self.page_start(page) % self.dims.b)
    }
}

/// Largest power of two not above `n`, and at least one.
fn floor_pow2(n: u64) -> u64 {
    if n == 0 {
        1
    } else {
        1 << (63 - n.leading_zeros())
    }
}

/// Pixels per page when each page may use `page_bytes` of heap and one pixel
/// occupies `pixel_bytes`.
pub fn page_pixels_for_budget(page_bytes: u64, pixel_bytes: u64) -> u64 {
    floor_pow2(page_bytes / pixel_bytes.max(1))
}

/// Pixels per page such that `target_pages` pages fit in `max_heap` bytes.
pub fn page_pixels_for_heap(max_heap: u64, target_pages: u64, pixel_bytes: u64) -> u64 {
    page_pixels_for_budget(max_heap / target_pages.max(1), pixel_bytes)
}

/// Coordinate addressing shared by every paged image.
///
/// Implementors supply the layout; the coordinate variants all reduce to a
/// bounds-checked linear index.
pub trait Addressable {
    /// Paging layout of the image.
    fn layout(&self) -> &PageLayout;

    /// Image extents.
    fn dims(&self) -> Dims {
        self.layout().dims()
    }

    /// Bounds-checked linear index of `c`.
    fn index_of(&self, c: Coord) -> Result<u64> {
        let dims = self.dims();
        dims.check(c)?;
        Ok(dims.linear_index(c))
    }

    /// Linear index of `(x, y)`.
    fn index_xy(&self, x: u64, y: u64) -> Result<u64> {
        self.index_of(Coord::xy(x, y))
    }

    /// Linear index of `(x, y, b)`.
    fn index_xyb(&self, x: u64, y: u64, b: u64) -> Result<u64> {
        self.index_of(Coord::xyb(x, y, b))
    }

    /// Linear index of `(x, y, z)`.
    fn index_xyz(&self, x: u64, y: u64, z: u64) -> Result<u64> {
        self.index_of(Coord::xyz(x, y, z))
    }

    /// Linear index of `(x, y, z, b)`.
    fn index_xyzb(&self, x: u64, y: u64, z: u64, b: u64) -> Result<u64> {
        self.index_of(Coord::xyzb(x, y, z, b))
    }

    /// Linear index of `(x, y, z, t)`.
    fn index_xyzt(&self, x: u64, y: u64, z: u64, t: u64) -> Result<u64> {
        self.index_of(Coord::xyzt(x, y, z, t))
    }

    /// Linear index of `(x, y, z, t, b)`.
    fn index_xyztb(&self, x: u64, y: u64, z: u64, t: u64, b: u64) -> Result<u64> {
        self.index_of(Coord::xyztb(x, y, z, t, b))
    }

    /// Page and in-page offset of `c`.
    fn locate(&self, c: Coord) -> Result<(PageId, usize)> {
        self.layout().locate(self.index_of(c)?)
    }
}
