//! Pages: the unit of caching, eviction and persistence.
//!
//! A page is a fixed-capacity run of pixels from one image. Its encoded form
//! is a 32-byte header followed by the elements in little-endian order; every
//! encoded page of an image has the same length, so it fits a fixed slot of
//! the image's backing file.

use core::convert::TryFrom;

use super::element::{Element, PageKind};
use crate::primitives::bytes::{decode_slice, encode_slice, le};
use crate::types::{page_crc32, ImageId, PageId, PagingError, Result};

/// Magic bytes opening every encoded page.
pub const PAGE_MAGIC: [u8; 4] = *b"LIPG";
/// Current encoded page format.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Length of the fixed page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// `LIPG`.
    pub const MAGIC: Range<usize> = 0..4;
    /// Little-endian `u16`.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// [`PageKind`](crate::storage::PageKind) tag.
    pub const PAGE_KIND: usize = 6;
    /// Always zero.
    pub const RESERVED: usize = 7;
    /// Little-endian `u32`.
    pub const ELEM_COUNT: Range<usize> = 8..12;
    /// Little-endian `u64`.
    pub const PAGE_NO: Range<usize> = 12..20;
    /// Little-endian `u32` over page number and body.
    pub const CRC32: Range<usize> = 20..24;
    /// Zero padding.
    pub const TAIL: Range<usize> = 24..32;
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Format version the page was written with.
    pub format_version: u16,
    /// Element kind, or [`PageKind::Empty`] for placeholders.
    pub kind: PageKind,
    /// Number of elements in the body.
    pub elem_count: u32,
    /// Page id the slot belongs to.
    pub page_no: PageId,
    /// CRC32 of page id and body.
    pub crc32: u32,
}

impl PageHeader {
    /// Header of an empty placeholder slot.
    pub fn placeholder(page_no: PageId) -> Self {
        Self {
            format_version: PAGE_FORMAT_VERSION,
            kind: PageKind::Empty,
            elem_count: 0,
            page_no,
            crc32: 0,
        }
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(PagingError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        le::put_u16(&mut hdr[header::FORMAT_VERSION], self.format_version);
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        le::put_u32(&mut hdr[header::ELEM_COUNT], self.elem_count);
        le::put_u64(&mut hdr[header::PAGE_NO], self.page_no.0);
        le::put_u32(&mut hdr[header::CRC32], self.crc32);
        hdr[header::TAIL].fill(0);
        Ok(())
    }

    /// Reads and validates the fixed fields of a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(PagingError::Corruption("page header truncated"));
        }
        if src[header::MAGIC] != PAGE_MAGIC {
            return Err(PagingError::Corruption("page magic mismatch"));
        }
        let format_version = le::get_u16(&src[header::FORMAT_VERSION]);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(PagingError::Corruption("unsupported page format version"));
        }
        Ok(Self {
            format_version,
            kind: PageKind::try_from(src[header::PAGE_KIND])?,
            elem_count: le::get_u32(&src[header::ELEM_COUNT]),
            page_no: PageId(le::get_u64(&src[header::PAGE_NO])),
            crc32: le::get_u32(&src[header::CRC32]),
        })
    }
}

/// A page of `T` pixels belonging to one image.
#[derive(Clone, Debug)]
pub struct Page<T: Element> {
    image: ImageId,
    id: PageId,
    data: Box<[T]>,
    dirty: bool,
    band_offset: Option<u64>,
    valid_length: Option<usize>,
}

/// Page of `u8` pixels.
pub type BytePage = Page<u8>;
/// Page of `bool` pixels.
pub type BoolPage = Page<bool>;
/// Page of `i32` pixels.
pub type IntPage = Page<i32>;
/// Page of `f64` pixels.
pub type DoublePage = Page<f64>;

impl<T: Element> Page<T> {
    /// Creates a clean, default-initialized page of `capacity` elements.
    pub fn new(image: ImageId, id: PageId, capacity: usize) -> Self {
        Self {
            image,
            id,
            data: vec![T::default(); capacity].into_boxed_slice(),
            dirty: false,
            band_offset: None,
            valid_length: None,
        }
    }

    /// Sets the band held at slot 0 and the logical length of a final page.
    pub fn with_geometry(mut self, band_offset: Option<u64>, valid_length: Option<usize>) -> Self {
        self.band_offset = band_offset;
        self.valid_length = valid_length.map(|len| len.min(self.data.len()));
        self
    }

    /// Owning image.
    pub fn image(&self) -> ImageId {
        self.image
    }

    /// Page id inside the image.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Allocated element count (the image page size).
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Logical element count: `valid_length` for a final partial page,
    /// otherwise the capacity.
    pub fn len(&self) -> usize {
        self.valid_length.unwrap_or(self.data.len())
    }

    /// Band index held at slot 0, when the image has more than one band.
    pub fn band_offset(&self) -> Option<u64> {
        self.band_offset
    }

    /// Logical length if this is the final, partial page.
    pub fn valid_length(&self) -> Option<usize> {
        self.valid_length
    }

    /// Whether the page changed since it was loaded or last written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Value at `offset`.
    pub fn get(&self, offset: usize) -> T {
        self.data[offset]
    }

    /// Stores `value` at `offset` and marks the page dirty.
    pub fn set(&mut self, offset: usize, value: T) {
        self.data[offset] = value;
        self.dirty = true;
    }

    /// Logical contents.
    pub fn values(&self) -> &[T] {
        &self.data[..self.len()]
    }

    /// Heap bytes held by the element array.
    pub fn heap_bytes(&self) -> u64 {
        T::heap_bytes(self.data.len())
    }

    /// Minimum over the logical contents.
    pub fn reduce_min(&self) -> Option<T> {
        self.values().iter().copied().reduce(T::lesser)
    }

    /// Maximum over the logical contents.
    pub fn reduce_max(&self) -> Option<T> {
        self.values().iter().copied().reduce(T::greater)
    }

    /// Minimum over the elements of `band` in an image with `bands` bands.
    pub fn reduce_band_min(&self, band: u64, bands: u64) -> Option<T> {
        self.band_values(band, bands).reduce(T::lesser)
    }

    /// Maximum over the elements of `band` in an image with `bands` bands.
    pub fn reduce_band_max(&self, band: u64, bands: u64) -> Option<T> {
        self.band_values(band, bands).reduce(T::greater)
    }

    fn band_values(&self, band: u64, bands: u64) -> impl Iterator<Item = T> + '_ {
        let (start, step) = if bands <= 1 {
            (0, 1)
        } else {
            let first = self.band_offset.unwrap_or(0) % bands;
            (((band % bands) + bands - first) % bands, bands)
        };
        self.values()
            .iter()
            .copied()
            .skip(start as usize)
            .step_by(step as usize)
    }

    /// Encoded size of a page with `capacity` elements.
    pub fn encoded_len(capacity: usize) -> usize {
        PAGE_HDR_LEN + capacity * T::WIDTH
    }

    /// Encodes the page into `dst`, which must be exactly [`Page::encoded_len`] bytes.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() != Self::encoded_len(self.data.len()) {
            return Err(PagingError::Invalid("page slot size mismatch"));
        }
        let elem_count = u32::try_from(self.data.len())
            .map_err(|_| PagingError::Invalid("page too large to encode"))?;
        let (hdr, body) = dst.split_at_mut(PAGE_HDR_LEN);
        encode_slice(body, &self.data, T::WIDTH, T::put);
        PageHeader {
            format_version: PAGE_FORMAT_VERSION,
            kind: T::KIND,
            elem_count,
            page_no: self.id,
            crc32: page_crc32(self.id.0, body),
        }
        .encode(hdr)
    }

    /// Encodes the page into a fresh buffer.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; Self::encoded_len(self.data.len())];
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a slot expected to hold page `id` with `capacity` elements.
    ///
    /// Returns `Ok(None)` for a placeholder slot. The result is clean and
    /// carries no geometry; callers recompute it from the page id.
    pub fn decode(image: ImageId, id: PageId, capacity: usize, src: &[u8]) -> Result<Option<Self>> {
        let hdr = PageHeader::decode(src)?;
        if hdr.page_no != id {
            return Err(PagingError::Corruption("page number mismatch"));
        }
        if hdr.kind == PageKind::Empty {
            return Ok(None);
        }
        if hdr.kind != T::KIND {
            return Err(PagingError::Corruption("page element kind mismatch"));
        }
        if hdr.elem_count as usize != capacity {
            return Err(PagingError::Corruption("page element count mismatch"));
        }
        let end = Self::encoded_len(capacity);
        if src.len() < end {
            return Err(PagingError::Corruption("page body truncated"));
        }
        let body = &src[PAGE_HDR_LEN..end];
        if page_crc32(id.0, body) != hdr.crc32 {
            return Err(PagingError::Corruption("page crc mismatch"));
        }
        let mut page = Self::new(image, id, capacity);
        decode_slice(&mut page.data, body, T::WIDTH, T::get);
        Ok(Some(page))
    }
}

impl<T: Element> PartialEq for Page<T> {
    fn eq(&self, other: &Self) -> bool {
        self.values() == other.values()
    }
}

impl Page<u8> {
    /// Whether every logical element is zero.
    pub fn is_empty(&self) -> bool {
        self.values().iter().all(|&v| v == 0)
    }
}

impl Page<bool> {
    /// Whether every logical element is false.
    pub fn is_empty(&self) -> bool {
        self.values().iter().all(|&v| !v)
    }
}
